//! lookout-core — Face gallery and recognition matching engine.
//!
//! Keeps the enrolled identities, matches per-frame face embeddings
//! against them and smooths the decisions across a video stream. Face
//! detection and embedding extraction are supplied by a [`FaceModel`].

pub mod config;
pub mod gallery;
pub mod matcher;
pub mod model;
pub mod pipeline;
pub mod stabilizer;
pub mod types;

pub use config::RecognitionConfig;
pub use gallery::{
    read_gallery, EnrollMetadata, Gallery, GalleryError, GalleryStore, Identity, ReferenceEmbedding,
};
pub use matcher::{compare_embeddings, CosineMatcher, MatchResult, Matcher, UNKNOWN_LABEL};
pub use model::{FaceModel, ModelError};
pub use pipeline::{Enroller, FrameOverlay, PipelineError, RecognitionPipeline};
pub use stabilizer::{TrackId, TrackOutput, TrackStabilizer, TrackState};
pub use types::{BoundingBox, Detection, Embedding, ValidationError, VideoFrame};
