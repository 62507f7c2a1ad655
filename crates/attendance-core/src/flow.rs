//! Enrollment and recognition flows.
//!
//! Each call is an independent, synchronous unit of work. The only state
//! shared between calls is what the [`Gallery`] persists, so a service can
//! be used from several threads at once.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::gallery::{Gallery, StorageError};
use crate::imaging::decode_image;
use crate::liveness::LivenessDetector;
use crate::matcher::{MatchPolicy, Matcher, DEFAULT_SIMILARITY_THRESHOLD};
use crate::models::ModelError;
use crate::types::{AttendanceEvent, IdentityId};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("employee name must not be blank")]
    InvalidName,
    #[error("liveness check failed: no blink detected")]
    LivenessFailure,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("inference error: {0}")]
    Inference(#[from] ModelError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<ExtractError> for FlowError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NoFaceDetected => FlowError::NoFaceDetected,
            ExtractError::Model(e) => FlowError::Inference(e),
        }
    }
}

/// Reason code carried by a failed response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidImage,
    InvalidName,
    LivenessFailure,
    NoFaceDetected,
    NoMatch,
    Inference,
    StorageFailure,
}

impl FlowError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FlowError::InvalidImage(_) => FailureKind::InvalidImage,
            FlowError::InvalidName => FailureKind::InvalidName,
            FlowError::LivenessFailure => FailureKind::LivenessFailure,
            FlowError::NoFaceDetected => FailureKind::NoFaceDetected,
            FlowError::Inference(_) => FailureKind::Inference,
            FlowError::Storage(_) => FailureKind::StorageFailure,
        }
    }

    /// Whether the caller sent something unusable, as opposed to an
    /// internal failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, FlowError::Inference(_) | FlowError::Storage(_))
    }
}

/// Outcome of a recognition attempt that passed the liveness gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Recognition {
    Matched {
        identity_id: IdentityId,
        name: String,
        similarity: f32,
        event: AttendanceEvent,
    },
    /// Authentication denied; nothing was recorded.
    NoMatch { best_similarity: f32 },
}

impl Recognition {
    pub fn is_match(&self) -> bool {
        matches!(self, Recognition::Matched { .. })
    }
}

/// Liveness gate + embedding extractor + matcher over a gallery.
pub struct AttendanceService<E, L, G> {
    extractor: E,
    liveness: L,
    gallery: G,
    policy: MatchPolicy,
    threshold: f32,
}

impl<E, L, G> AttendanceService<E, L, G>
where
    E: EmbeddingExtractor,
    L: LivenessDetector,
    G: Gallery,
{
    pub fn new(extractor: E, liveness: L, gallery: G) -> Self {
        Self {
            extractor,
            liveness,
            gallery,
            policy: MatchPolicy::default(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn gallery(&self) -> &G {
        &self.gallery
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Register a new identity from a live capture.
    pub fn enroll(&self, name: &str, image: &RgbImage) -> Result<IdentityId, FlowError> {
        if name.trim().is_empty() {
            return Err(FlowError::InvalidName);
        }

        if !self.liveness.is_live(image)? {
            tracing::info!(name, "enrollment denied: liveness check failed");
            return Err(FlowError::LivenessFailure);
        }

        let embedding = self.extractor.extract(image)?;
        let identity_id = self.gallery.add_identity(name, &embedding)?;

        tracing::info!(identity_id, name, "identity enrolled");
        Ok(identity_id)
    }

    /// Decode `bytes` and [`enroll`](Self::enroll).
    pub fn enroll_bytes(&self, name: &str, bytes: &[u8]) -> Result<IdentityId, FlowError> {
        if name.trim().is_empty() {
            return Err(FlowError::InvalidName);
        }
        let image = decode_image(bytes)?;
        self.enroll(name, &image)
    }

    /// Authenticate a live capture and log attendance on a match.
    pub fn recognize(&self, image: &RgbImage) -> Result<Recognition, FlowError> {
        if !self.liveness.is_live(image)? {
            tracing::info!("recognition denied: liveness check failed");
            return Err(FlowError::LivenessFailure);
        }

        let probe = self.extractor.extract(image)?;
        let gallery = self.gallery.list_identities()?;
        let result = self.policy.compare(&probe, &gallery, self.threshold);

        let (Some(identity_id), Some(name)) = (result.identity_id, result.name) else {
            tracing::info!(
                gallery = gallery.len(),
                best_similarity = result.similarity,
                threshold = self.threshold,
                "recognition denied: no match"
            );
            return Ok(Recognition::NoMatch {
                best_similarity: result.similarity,
            });
        };

        let event = self.gallery.record_attendance(identity_id)?;
        tracing::info!(
            identity_id,
            name = %name,
            similarity = result.similarity,
            event_id = event.id,
            "attendance recorded"
        );

        Ok(Recognition::Matched {
            identity_id,
            name,
            similarity: result.similarity,
            event,
        })
    }

    /// Decode `bytes` and [`recognize`](Self::recognize).
    pub fn recognize_bytes(&self, bytes: &[u8]) -> Result<Recognition, FlowError> {
        let image = decode_image(bytes)?;
        self.recognize(&image)
    }
}
