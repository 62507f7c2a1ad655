//! Blink-based liveness gate using the eye-aspect-ratio (EAR) heuristic.
//!
//! For each detected face the six boundary points of each eye give
//!
//! ```text
//! EAR = (d(p2, p6) + d(p3, p5)) / (2 · d(p1, p4))
//! ```
//!
//! and a face whose eyes are *both* below the threshold counts as a blink.
//!
//! # Threat Coverage
//!
//! - **Blocks:** photos of a subject with open eyes.
//! - **Does not block:** a photo taken mid-blink, video replay, masks. This
//!   is a single-frame heuristic, not a liveness guarantee.
//! - **Does not block:** a second, blinking person in the same frame. Any
//!   blinking face passes the gate, while the embedding is taken from the
//!   most confident face, so one subject per capture is assumed.

use crate::landmarks::FaceLandmarks;
use crate::models::{ModelContext, ModelError};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_EAR_THRESHOLD: f32 = 0.25;

/// iBUG-68 indices of p1..p6 for each eye.
const LEFT_EYE: [usize; 6] = [36, 37, 38, 39, 40, 41];
const RIGHT_EYE: [usize; 6] = [42, 43, 44, 45, 46, 47];

/// How point-to-point distances inside the EAR formula are measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarDistance {
    /// |Δx| only. Matches the historical attendance heuristic; vertical eye
    /// opening barely registers, so the ratio is noisy.
    #[default]
    Horizontal,
    /// Full 2-D Euclidean distance (the textbook EAR).
    Euclidean,
}

impl EarDistance {
    fn between(self, a: (f32, f32), b: (f32, f32)) -> f32 {
        match self {
            EarDistance::Horizontal => (a.0 - b.0).abs(),
            EarDistance::Euclidean => ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt(),
        }
    }
}

impl fmt::Display for EarDistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EarDistance::Horizontal => f.write_str("horizontal"),
            EarDistance::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for EarDistance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "horizontal" | "x-only" => Ok(EarDistance::Horizontal),
            "euclidean" => Ok(EarDistance::Euclidean),
            other => Err(format!(
                "unknown EAR distance {other:?} (expected \"horizontal\" or \"euclidean\")"
            )),
        }
    }
}

/// Eye-aspect-ratio of one eye given its six boundary points p1..p6.
///
/// A zero eye width yields `+∞`, which never counts as a blink.
pub fn eye_aspect_ratio(eye: &[(f32, f32); 6], distance: EarDistance) -> f32 {
    let [p1, p2, p3, p4, p5, p6] = *eye;
    let width = distance.between(p1, p4);
    if width <= f32::EPSILON {
        return f32::INFINITY;
    }
    (distance.between(p2, p6) + distance.between(p3, p5)) / (2.0 * width)
}

/// EAR of both eyes of one face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EyeRatios {
    pub left: f32,
    pub right: f32,
}

impl EyeRatios {
    pub fn from_landmarks(points: &FaceLandmarks, distance: EarDistance) -> Self {
        let eye = |idx: [usize; 6]| idx.map(|i| points[i]);
        Self {
            left: eye_aspect_ratio(&eye(LEFT_EYE), distance),
            right: eye_aspect_ratio(&eye(RIGHT_EYE), distance),
        }
    }

    pub fn is_blink(&self, threshold: f32) -> bool {
        self.left < threshold && self.right < threshold
    }
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessReport {
    pub is_live: bool,
    /// Faces found by the detector.
    pub faces_detected: usize,
    /// EAR pairs of the faces examined, in detection order. Evaluation stops
    /// at the first blinking face.
    pub ratios: Vec<EyeRatios>,
}

impl LivenessReport {
    pub fn no_face() -> Self {
        Self {
            is_live: false,
            faces_detected: 0,
            ratios: Vec::new(),
        }
    }
}

/// Decides whether a captured image shows a live subject.
pub trait LivenessDetector {
    fn check(&self, image: &RgbImage) -> Result<LivenessReport, ModelError>;

    fn is_live(&self, image: &RgbImage) -> Result<bool, ModelError> {
        Ok(self.check(image)?.is_live)
    }
}

/// Tunables for [`BlinkLivenessDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkConfig {
    pub ear_threshold: f32,
    pub distance: EarDistance,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            distance: EarDistance::default(),
        }
    }
}

/// Evaluate per-face landmarks lazily: live as soon as one face blinks.
pub fn assess<I>(faces_detected: usize, landmarks: I, config: &BlinkConfig) -> Result<LivenessReport, ModelError>
where
    I: IntoIterator<Item = Result<FaceLandmarks, ModelError>>,
{
    let mut ratios = Vec::new();
    for points in landmarks {
        let pair = EyeRatios::from_landmarks(&points?, config.distance);
        ratios.push(pair);
        if pair.is_blink(config.ear_threshold) {
            return Ok(LivenessReport {
                is_live: true,
                faces_detected,
                ratios,
            });
        }
    }

    Ok(LivenessReport {
        is_live: false,
        faces_detected,
        ratios,
    })
}

/// SCRFD detection + 68-point landmarks + EAR blink test.
pub struct BlinkLivenessDetector {
    models: Arc<ModelContext>,
    config: BlinkConfig,
}

impl BlinkLivenessDetector {
    pub fn new(models: Arc<ModelContext>, config: BlinkConfig) -> Self {
        Self { models, config }
    }
}

impl LivenessDetector for BlinkLivenessDetector {
    fn check(&self, image: &RgbImage) -> Result<LivenessReport, ModelError> {
        let faces = self.models.detector.detect(image)?;
        if faces.is_empty() {
            tracing::debug!("liveness: no face detected");
            return Ok(LivenessReport::no_face());
        }

        let report = assess(
            faces.len(),
            faces.iter().map(|f| self.models.landmarks.predict(image, f)),
            &self.config,
        )?;

        tracing::debug!(
            live = report.is_live,
            faces = report.faces_detected,
            ratios = ?report.ratios,
            threshold = self.config.ear_threshold,
            distance = %self.config.distance,
            "liveness check"
        );
        Ok(report)
    }
}
