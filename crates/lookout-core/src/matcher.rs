//! Identity matching of a probe embedding against the enrolled gallery.

use crate::gallery::Gallery;
use crate::types::{Embedding, ValidationError};
use serde::Serialize;

/// Label shown for a face that matched nobody.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity key; `None` when the best score missed the threshold.
    pub identity: Option<String>,
    /// Best-scoring identity regardless of the threshold.
    pub candidate: Option<String>,
    /// Cosine similarity of the best candidate [-1, 1], 0 for an empty gallery.
    pub similarity: f32,
    pub is_match: bool,
    /// Another identity scored within epsilon of the match.
    pub ambiguous: bool,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            identity: None,
            candidate: None,
            similarity: 0.0,
            is_match: false,
            ambiguous: false,
        }
    }

    /// Identity key, or [`UNKNOWN_LABEL`].
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// Implementations must keep per-identity max pooling and the acceptance
/// threshold semantics of [`CosineMatcher`].
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchResult, ValidationError>;
}

/// Exhaustive cosine similarity matcher.
///
/// Scores every reference of every identity; an identity's score is the
/// best over its references.
#[derive(Debug, Clone)]
pub struct CosineMatcher {
    pub threshold: f32,
    pub ambiguity_epsilon: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32, ambiguity_epsilon: f32) -> Self {
        Self {
            threshold,
            ambiguity_epsilon,
        }
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> Result<MatchResult, ValidationError> {
        gallery.check(probe)?;
        let probe = probe.normalized();

        let mut best: Option<(&str, f32)> = None;
        let mut runner_up: Option<f32> = None;

        // Key order plus strict `>` makes exact ties resolve to the smaller key.
        for identity in gallery.identities() {
            let score = identity
                .references
                .iter()
                .map(|r| probe.dot(&r.embedding))
                .fold(f32::NEG_INFINITY, f32::max);

            match best {
                Some((_, best_score)) if score <= best_score => {
                    if runner_up.map_or(true, |r| score > r) {
                        runner_up = Some(score);
                    }
                }
                _ => {
                    runner_up = best.map(|(_, s)| s);
                    best = Some((identity.key.as_str(), score));
                }
            }
        }

        let Some((key, similarity)) = best else {
            return Ok(MatchResult::unknown());
        };
        let similarity = similarity.clamp(-1.0, 1.0);
        let is_match = similarity >= self.threshold;
        let ambiguous = is_match
            && runner_up.is_some_and(|r| r >= self.threshold && similarity - r < self.ambiguity_epsilon);

        Ok(MatchResult {
            identity: is_match.then(|| key.to_string()),
            candidate: Some(key.to_string()),
            similarity,
            is_match,
            ambiguous,
        })
    }
}

/// Similarity of two faces, clamped to [0, 1].
///
/// Both embeddings must come from the same model and have the same length.
pub fn compare_embeddings(a: &Embedding, b: &Embedding) -> Result<f32, ValidationError> {
    a.validate(&a.model_version, a.dimension())?;
    b.validate(&a.model_version, a.dimension())?;
    Ok(a.similarity(b).clamp(0.0, 1.0))
}
