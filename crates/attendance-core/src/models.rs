//! Process-wide model context.
//!
//! All ONNX sessions are loaded once into a [`ModelContext`] and shared
//! read-only (behind `Arc`) by the embedding extractor and the liveness
//! detector. `ort` needs `&mut Session` to run, so each session sits behind
//! its own mutex; weights are never touched after load.

use crate::detector::FaceDetector;
use crate::landmarks::LandmarkPredictor;
use crate::recognizer::FaceRecognizer;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const LANDMARK_MODEL_FILE: &str = "1k3d68.onnx";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {}; download from insightface and place in the model directory", .0.display())]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("{0} session lock poisoned by an earlier panic")]
    Poisoned(&'static str),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locations of the three ONNX models.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub landmarks: PathBuf,
}

impl ModelPaths {
    /// Standard insightface file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(SCRFD_MODEL_FILE),
            recognizer: dir.join(ARCFACE_MODEL_FILE),
            landmarks: dir.join(LANDMARK_MODEL_FILE),
        }
    }

    /// Paths that do not exist on disk.
    pub fn missing(&self) -> Vec<&Path> {
        [&self.detector, &self.recognizer, &self.landmarks]
            .into_iter()
            .filter(|p| !p.exists())
            .map(PathBuf::as_path)
            .collect()
    }
}

/// Loaded detector, recognizer and landmark models.
pub struct ModelContext {
    pub detector: FaceDetector,
    pub recognizer: FaceRecognizer,
    pub landmarks: LandmarkPredictor,
}

impl ModelContext {
    /// Load every model, failing fast on the first missing or invalid file.
    pub fn load(paths: &ModelPaths) -> Result<Arc<Self>, ModelError> {
        let detector = FaceDetector::load(&paths.detector)?;
        let recognizer = FaceRecognizer::load(&paths.recognizer)?;
        let landmarks = LandmarkPredictor::load(&paths.landmarks)?;
        tracing::info!("model context ready");

        Ok(Arc::new(Self {
            detector,
            recognizer,
            landmarks,
        }))
    }
}

/// Open an ONNX session, logging its tensor signature.
pub(crate) fn open_session(path: &Path, kind: &'static str) -> Result<Mutex<Session>, ModelError> {
    if !path.exists() {
        return Err(ModelError::ModelNotFound(path.to_path_buf()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded {kind} model"
    );

    Ok(Mutex::new(session))
}

pub(crate) fn lock_session<'a>(
    session: &'a Mutex<Session>,
    kind: &'static str,
) -> Result<MutexGuard<'a, Session>, ModelError> {
    session.lock().map_err(|_| ModelError::Poisoned(kind))
}
