//! Gallery matching by cosine similarity.

use crate::types::{Embedding, Identity, IdentityId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default cosine similarity a probe must exceed to count as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.5;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Similarity of the returned identity when matched; otherwise the best
    /// similarity seen (0.0 if nothing was comparable).
    pub similarity: f32,
    pub identity_id: Option<IdentityId>,
    pub name: Option<String>,
}

impl MatchResult {
    fn hit(identity: &Identity, similarity: f32) -> Self {
        Self {
            matched: true,
            similarity,
            identity_id: Some(identity.id),
            name: Some(identity.name.clone()),
        }
    }

    fn miss(best_similarity: Option<f32>) -> Self {
        Self {
            matched: false,
            similarity: best_similarity.unwrap_or(0.0),
            identity_id: None,
            name: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult;
}

/// Returns the first identity, in listing order, whose similarity strictly
/// exceeds the threshold. Order-dependent: a later, closer identity is never
/// considered once an earlier one qualifies.
pub struct FirstAboveThreshold;

impl Matcher for FirstAboveThreshold {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult {
        let mut best: Option<f32> = None;

        for identity in gallery {
            let Some(sim) = probe.similarity(&identity.embedding) else {
                tracing::warn!(
                    identity_id = identity.id,
                    probe_dim = probe.dimension(),
                    stored_dim = identity.embedding.dimension(),
                    "skipping non-comparable gallery embedding"
                );
                continue;
            };
            if sim > threshold {
                return MatchResult::hit(identity, sim);
            }
            best = Some(best.map_or(sim, |b| b.max(sim)));
        }

        MatchResult::miss(best)
    }
}

/// Arg-max over every gallery entry; matches only if the best similarity
/// strictly exceeds the threshold. Ties keep the earlier entry.
pub struct BestAboveThreshold;

impl Matcher for BestAboveThreshold {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult {
        let mut best: Option<(f32, &Identity)> = None;

        for identity in gallery {
            let Some(sim) = probe.similarity(&identity.embedding) else {
                continue;
            };
            if best.map_or(true, |(b, _)| sim > b) {
                best = Some((sim, identity));
            }
        }

        match best {
            Some((sim, identity)) if sim > threshold => MatchResult::hit(identity, sim),
            other => MatchResult::miss(other.map(|(sim, _)| sim)),
        }
    }
}

/// Configurable selection between the matcher strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// [`FirstAboveThreshold`].
    #[default]
    First,
    /// [`BestAboveThreshold`].
    Best,
}

impl MatchPolicy {
    pub fn matcher(self) -> &'static (dyn Matcher + Send + Sync) {
        match self {
            MatchPolicy::First => &FirstAboveThreshold,
            MatchPolicy::Best => &BestAboveThreshold,
        }
    }
}

impl Matcher for MatchPolicy {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult {
        self.matcher().compare(probe, gallery, threshold)
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::First => f.write_str("first"),
            MatchPolicy::Best => f.write_str("best"),
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(MatchPolicy::First),
            "best" => Ok(MatchPolicy::Best),
            other => Err(format!("unknown match policy {other:?} (expected \"first\" or \"best\")")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: IdentityId, name: &str, values: Vec<f32>) -> Identity {
        Identity {
            id,
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_first_policy_returns_first_above_threshold() {
        // Both entries exceed 0.5; the second is a closer match but comes later.
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            identity(1, "first", vec![0.8, 0.6, 0.0]),
            identity(2, "exact", vec![1.0, 0.0, 0.0]),
        ];

        let result = FirstAboveThreshold.compare(&probe, &gallery, 0.5);
        assert!(result.matched);
        assert_eq!(result.identity_id, Some(1));
        assert_eq!(result.name.as_deref(), Some("first"));
        assert!((result.similarity - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_best_policy_returns_global_maximum() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            identity(1, "first", vec![0.8, 0.6, 0.0]),
            identity(2, "exact", vec![1.0, 0.0, 0.0]),
        ];

        let result = BestAboveThreshold.compare(&probe, &gallery, 0.5);
        assert!(result.matched);
        assert_eq!(result.identity_id, Some(2));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        for threshold in [-1.0, 0.0, 0.5, 0.99] {
            for policy in [MatchPolicy::First, MatchPolicy::Best] {
                let result = policy.compare(&probe, &[], threshold);
                assert!(!result.matched);
                assert_eq!(result.similarity, 0.0);
                assert_eq!(result.identity_id, None);
            }
        }
    }

    #[test]
    fn test_orthogonal_probe_does_not_match() {
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![identity(7, "alice", vec![0.0, 1.0, 0.0])];

        let result = FirstAboveThreshold.compare(&probe, &gallery, 0.5);
        assert!(!result.matched);
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_strict() {
        // cos = 0.6 exactly; threshold 0.6 must not match.
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![identity(1, "edge", vec![0.6, 0.8])];

        assert!(!FirstAboveThreshold.compare(&probe, &gallery, 0.6).matched);
        assert!(!BestAboveThreshold.compare(&probe, &gallery, 0.6).matched);
        assert!(FirstAboveThreshold.compare(&probe, &gallery, 0.59).matched);
    }

    #[test]
    fn test_zero_norm_entries_are_skipped() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![
            identity(1, "blank", vec![0.0, 0.0]),
            identity(2, "bob", vec![1.0, 0.1]),
        ];

        // A negative threshold must not let the zero-norm entry through.
        let result = FirstAboveThreshold.compare(&probe, &gallery, -0.5);
        assert_eq!(result.identity_id, Some(2));
    }

    #[test]
    fn test_zero_norm_probe_is_no_match() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![identity(1, "bob", vec![1.0, 0.0])];

        for policy in [MatchPolicy::First, MatchPolicy::Best] {
            let result = policy.compare(&probe, &gallery, -1.0);
            assert!(!result.matched);
        }
    }

    #[test]
    fn test_miss_reports_best_similarity() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![
            identity(1, "a", vec![0.0, 1.0]),
            identity(2, "b", vec![0.3, 0.9539392]),
        ];

        let result = FirstAboveThreshold.compare(&probe, &gallery, 0.5);
        assert!(!result.matched);
        assert!((result.similarity - 0.3).abs() < 1e-4);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("first".parse::<MatchPolicy>(), Ok(MatchPolicy::First));
        assert_eq!(" BEST ".parse::<MatchPolicy>(), Ok(MatchPolicy::Best));
        assert!("closest".parse::<MatchPolicy>().is_err());
        assert_eq!(MatchPolicy::default(), MatchPolicy::First);
    }
}
