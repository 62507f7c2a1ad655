//! Image decoding and sub-pixel sampling shared by the vision models.

use image::RgbImage;

/// Decode encoded image bytes (JPEG, PNG, ...) into an RGB image.
///
/// The container format is sniffed from the bytes; grey and alpha inputs
/// are converted to three-channel RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    Ok(decoded.to_rgb8())
}

/// Bilinearly sample an RGB image at a sub-pixel position.
///
/// Neighbours outside the image contribute black, so samples fade out
/// towards the border instead of smearing edge pixels.
pub fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let pixel = |px: i64, py: i64| -> [f32; 3] {
        if px >= 0 && px < w && py >= 0 && py < h {
            let p = image.get_pixel(px as u32, py as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = pixel(x0, y0);
    let tr = pixel(x0 + 1, y0);
    let bl = pixel(x0, y0 + 1);
    let br = pixel(x0 + 1, y0 + 1);

    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy
    })
}

/// Build an `out_size`×`out_size` crop by mapping every output pixel back
/// into the source image through `to_source`.
pub fn warp_rgb<F>(image: &RgbImage, out_size: u32, to_source: F) -> RgbImage
where
    F: Fn(f32, f32) -> (f32, f32),
{
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let (sx, sy) = to_source(ox as f32, oy as f32);
        let v = sample_bilinear(image, sx, sy);
        image::Rgb(v.map(|c| c.round().clamp(0.0, 255.0) as u8))
    })
}
