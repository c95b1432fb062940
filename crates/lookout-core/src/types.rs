use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection reasons for embeddings and identity keys.
///
/// The offending unit of work (one detection, one enroll request) is
/// dropped by the caller; nothing else is affected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("embedding has no values")]
    EmptyEmbedding,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding model version mismatch: expected {expected}, got {actual}")]
    ModelVersionMismatch { expected: String, actual: String },
    #[error("embedding contains NaN or infinite values")]
    NonFinite,
    #[error("embedding has zero norm and cannot be normalized")]
    ZeroNorm,
    #[error("identity key is empty")]
    EmptyIdentityKey,
}

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union in [0, 1]. Degenerate boxes overlap nothing.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = (self.x + self.width).min(other.x + other.width);
        let iy2 = (self.y + self.height).min(other.y + other.height);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Check that this embedding is comparable with a gallery built for
    /// `model_version` at `dimension`, and that it can be normalized.
    pub fn validate(&self, model_version: &str, dimension: usize) -> Result<(), ValidationError> {
        if self.values.is_empty() {
            return Err(ValidationError::EmptyEmbedding);
        }
        if self.values.len() != dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: dimension,
                actual: self.values.len(),
            });
        }
        if self.model_version != model_version {
            return Err(ValidationError::ModelVersionMismatch {
                expected: model_version.to_string(),
                actual: self.model_version.clone(),
            });
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite);
        }
        if self.norm() <= 0.0 {
            return Err(ValidationError::ZeroNorm);
        }
        Ok(())
    }

    /// Return an L2-normalized copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { (dot / denom).clamp(-1.0, 1.0) } else { 0.0 }
    }

    /// Dot product, equal to cosine similarity when both sides are unit length.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// One face reported by the external model for one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    pub embedding: Embedding,
}

/// A captured video frame handed to the model collaborator.
#[derive(Clone)]
pub struct VideoFrame {
    /// Capture order, strictly increasing per source.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Pixel data in whatever layout the model backend expects.
    pub data: Vec<u8>,
    pub captured_at: std::time::Instant,
}

impl VideoFrame {
    pub fn new(sequence: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            sequence,
            width,
            height,
            data,
            captured_at: std::time::Instant::now(),
        }
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding::new(values, "test")
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_self_similarity_is_one() {
        let a = emb(vec![3.0, -4.0, 12.0]).normalized();
        assert!((a.norm() - 1.0).abs() < 1e-6);
        assert!((a.dot(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_accepts_matching_embedding() {
        assert!(emb(vec![0.5, 0.5]).validate("test", 2).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_dimension() {
        let err = emb(vec![1.0, 0.0, 0.0]).validate("test", 2).unwrap_err();
        assert_eq!(err, ValidationError::DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_validate_rejects_wrong_model_version() {
        let e = Embedding::new(vec![1.0, 0.0], "other");
        assert!(matches!(
            e.validate("test", 2),
            Err(ValidationError::ModelVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_nan_and_zero() {
        assert_eq!(emb(vec![f32::NAN, 1.0]).validate("test", 2), Err(ValidationError::NonFinite));
        assert_eq!(emb(vec![0.0, 0.0]).validate("test", 2), Err(ValidationError::ZeroNorm));
        assert_eq!(emb(vec![]).validate("test", 0), Err(ValidationError::EmptyEmbedding));
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        // Overlap 5x10 = 50, union 100 + 100 - 50 = 150.
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate_box() {
        let a = BoundingBox::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }
}
