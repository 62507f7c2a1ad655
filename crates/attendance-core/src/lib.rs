//! Face-recognition attendance engine.
//!
//! A blink-based liveness gate (SCRFD + 68-point landmarks) guards an
//! ArcFace embedding pipeline; probes are matched against the enrolled
//! gallery by cosine similarity and successful matches are logged as
//! attendance events through the [`Gallery`] trait.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod flow;
pub mod gallery;
pub mod imaging;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod models;
pub mod recognizer;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractError, FaceEmbedder};
pub use flow::{AttendanceService, FailureKind, FlowError, Recognition};
pub use gallery::{Gallery, StorageError};
pub use liveness::{BlinkLivenessDetector, EarDistance, LivenessDetector, LivenessReport};
pub use matcher::{BestAboveThreshold, FirstAboveThreshold, MatchPolicy, MatchResult, Matcher};
pub use models::{ModelContext, ModelError, ModelPaths};
pub use types::{
    AttendanceEvent, AttendanceRecord, BoundingBox, Embedding, EmployeeSummary, Identity,
    IdentityId,
};
