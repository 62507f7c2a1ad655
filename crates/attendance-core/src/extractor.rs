//! Image → embedding contract and its SCRFD + ArcFace implementation.

use crate::models::{ModelContext, ModelError};
use crate::recognizer::ARCFACE_EMBEDDING_DIM;
use crate::types::Embedding;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Maps a decoded face image to a fixed-length embedding.
pub trait EmbeddingExtractor {
    /// Length of every embedding this extractor produces.
    fn dimension(&self) -> usize;

    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractError>;
}

/// Embeds the most confident face in the image.
pub struct FaceEmbedder {
    models: Arc<ModelContext>,
}

impl FaceEmbedder {
    pub fn new(models: Arc<ModelContext>) -> Self {
        Self { models }
    }
}

impl EmbeddingExtractor for FaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractError> {
        let faces = self.models.detector.detect(image)?;
        let face = faces.first().ok_or(ExtractError::NoFaceDetected)?;

        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            "embedding: best face selected"
        );

        Ok(self.models.recognizer.extract(image, face)?)
    }
}
