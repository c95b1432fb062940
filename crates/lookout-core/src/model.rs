//! Capability interface to the external face detection + embedding model.

use crate::types::{Detection, VideoFrame};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame {0} unavailable to the model backend")]
    FrameUnavailable(u64),
}

/// Face detector and embedder in one call.
///
/// Implementations may be stateful (warm sessions, replay cursors), hence
/// `&mut self`. A failure affects only the frame it was called with.
pub trait FaceModel: Send {
    fn detect_and_embed(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>, ModelError>;

    /// Model version tag carried by every embedding this backend emits.
    fn model_version(&self) -> &str;
}
