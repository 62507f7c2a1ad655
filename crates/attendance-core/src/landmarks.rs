//! 68-point facial landmark predictor (insightface `1k3d68`) via ONNX Runtime.
//!
//! Points follow the iBUG 68 scheme: jaw 0–16, brows 17–26, nose 27–35,
//! left eye 36–41, right eye 42–47, mouth 48–67.

use crate::imaging::warp_rgb;
use crate::models::{lock_session, open_session, ModelError};
use crate::types::BoundingBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const LANDMARK_INPUT_SIZE: u32 = 192;
/// The crop spans this multiple of the face box's longer side.
const LANDMARK_CROP_FACTOR: f32 = 1.5;
const LANDMARK_MEAN: f32 = 0.0;
const LANDMARK_STD: f32 = 1.0;
pub const LANDMARK_COUNT: usize = 68;
/// The model emits (x, y, z) per point; the 2-D points are the trailing 68 rows.
const LANDMARK_DIMS: usize = 3;

/// 68 landmark points in image coordinates.
pub type FaceLandmarks = [(f32, f32); LANDMARK_COUNT];

/// Axis-aligned crop centred on a face, scaled into the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Crop {
    cx: f32,
    cy: f32,
    /// Model-input pixels per image pixel.
    scale: f32,
}

impl Crop {
    fn around(face: &BoundingBox) -> Self {
        let (cx, cy) = face.center();
        let side = face.width.max(face.height).max(1.0) * LANDMARK_CROP_FACTOR;
        Self {
            cx,
            cy,
            scale: LANDMARK_INPUT_SIZE as f32 / side,
        }
    }

    fn to_image(&self, x: f32, y: f32) -> (f32, f32) {
        let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
        ((x - half) / self.scale + self.cx, (y - half) / self.scale + self.cy)
    }
}

pub struct LandmarkPredictor {
    session: Mutex<Session>,
}

impl LandmarkPredictor {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        Ok(Self {
            session: open_session(model_path, "landmark-68")?,
        })
    }

    /// Predict the 68 landmarks of `face` in image coordinates.
    pub fn predict(&self, image: &RgbImage, face: &BoundingBox) -> Result<FaceLandmarks, ModelError> {
        let crop = Crop::around(face);
        let patch = warp_rgb(image, LANDMARK_INPUT_SIZE, |x, y| crop.to_image(x, y));
        let input = preprocess(&patch);

        let mut session = lock_session(&self.session, "landmark-68")?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("landmark extraction: {e}")))?;

        let points = decode(raw, &crop)?;
        Ok(points)
    }
}

fn preprocess(patch: &RgbImage) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in patch.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - LANDMARK_MEAN) / LANDMARK_STD;
        }
    }
    tensor
}

/// Convert raw model output (normalised to [-1, 1] in crop space) into image
/// coordinates.
fn decode(raw: &[f32], crop: &Crop) -> Result<FaceLandmarks, ModelError> {
    let needed = LANDMARK_COUNT * LANDMARK_DIMS;
    if raw.len() < needed || raw.len() % LANDMARK_DIMS != 0 {
        return Err(ModelError::InferenceFailed(format!(
            "landmark output has {} values, expected a multiple of {LANDMARK_DIMS} ≥ {needed}",
            raw.len()
        )));
    }

    let tail = &raw[raw.len() - needed..];
    let half = LANDMARK_INPUT_SIZE as f32 / 2.0;
    Ok(std::array::from_fn(|i| {
        let x = (tail[i * LANDMARK_DIMS] + 1.0) * half;
        let y = (tail[i * LANDMARK_DIMS + 1] + 1.0) * half;
        crop.to_image(x, y)
    }))
}
