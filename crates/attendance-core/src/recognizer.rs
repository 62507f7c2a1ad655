//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from aligned 112×112 RGB face crops
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::models::{lock_session, open_session, ModelError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Mutex<Session>,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        Ok(Self {
            session: open_session(model_path, "ArcFace")?,
        })
    }

    /// Extract an L2-normalised embedding for `face`.
    ///
    /// The face is aligned from its five keypoints; a box without keypoints
    /// falls back to a square crop around the box.
    pub fn extract(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, ModelError> {
        let aligned = match &face.landmarks {
            Some(landmarks) => alignment::align_face(image, landmarks),
            None => square_crop(image, face),
        };
        let input = preprocess(&aligned);

        let raw: Vec<f32> = {
            let mut session = lock_session(&self.session, "ArcFace")?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw))
    }
}

/// Resize the square around a keypoint-less box to the ArcFace input size.
fn square_crop(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let (cx, cy) = face.center();
    let side = face.width.max(face.height).max(1.0);
    let step = side / ALIGNED_SIZE as f32;
    let x0 = cx - side / 2.0;
    let y0 = cy - side / 2.0;
    crate::imaging::warp_rgb(image, ALIGNED_SIZE, |x, y| (x0 + x * step, y0 + y * step))
}

/// Normalise an aligned RGB crop into a NCHW float tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Embedding {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        Embedding::new(raw.into_iter().map(|x| x / norm).collect())
    } else {
        Embedding::new(raw)
    }
}
