//! Recognition pipeline: one frame of detect, match and stabilize.
//!
//! Owned by whichever thread runs the frame loop. Gallery reads go through
//! a per-frame snapshot, so enrollment on other threads never blocks it.

use crate::config::RecognitionConfig;
use crate::gallery::{EnrollMetadata, GalleryError, GalleryStore};
use crate::matcher::Matcher;
use crate::model::{FaceModel, ModelError};
use crate::stabilizer::{FaceObservation, TrackId, TrackOutput, TrackStabilizer};
use crate::types::{BoundingBox, Detection, Embedding, VideoFrame};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame {sequence} arrived after frame {last}; dropped")]
    OutOfOrder { sequence: u64, last: u64 },
    #[error("model failed on frame {sequence}: {source}")]
    Model {
        sequence: u64,
        #[source]
        source: ModelError,
    },
}

/// Recognition overlay for one frame, handed to the UI as an immutable value.
#[derive(Debug, Clone, Serialize)]
pub struct FrameOverlay {
    pub sequence: u64,
    /// Live tracks, observed this frame or coasting until expiry.
    pub faces: Vec<TrackOutput>,
    /// Tracks that expired this frame.
    pub expired: Vec<TrackId>,
    /// Detections discarded for low confidence or an unusable embedding.
    pub dropped: usize,
    pub processing_ms: f64,
}

/// Applies enrollment requests coming from a live capture.
///
/// Cheap to clone; holds only the shared store.
#[derive(Clone)]
pub struct Enroller {
    store: Arc<GalleryStore>,
}

impl Enroller {
    pub fn new(store: Arc<GalleryStore>) -> Self {
        Self { store }
    }

    pub fn enroll_from_frame(
        &self,
        bbox: BoundingBox,
        embedding: &Embedding,
        identity_key: &str,
    ) -> Result<Uuid, GalleryError> {
        let metadata = EnrollMetadata::now().with_source("live").with_box(bbox);
        self.store.enroll(identity_key, embedding, metadata)
    }

    pub fn store(&self) -> &Arc<GalleryStore> {
        &self.store
    }
}

pub struct RecognitionPipeline {
    store: Arc<GalleryStore>,
    matcher: Box<dyn Matcher>,
    stabilizer: TrackStabilizer,
    min_detection_confidence: f32,
    last_sequence: Option<u64>,
}

impl RecognitionPipeline {
    pub fn new(store: Arc<GalleryStore>, config: &RecognitionConfig) -> Self {
        Self::with_matcher(store, Box::new(config.matcher()), config)
    }

    pub fn with_matcher(
        store: Arc<GalleryStore>,
        matcher: Box<dyn Matcher>,
        config: &RecognitionConfig,
    ) -> Self {
        Self {
            store,
            matcher,
            stabilizer: TrackStabilizer::new(config.stabilizer()),
            min_detection_confidence: config.min_detection_confidence,
            last_sequence: None,
        }
    }

    pub fn store(&self) -> &Arc<GalleryStore> {
        &self.store
    }

    pub fn enroller(&self) -> Enroller {
        Enroller::new(Arc::clone(&self.store))
    }

    /// Enroll a face seen in a live frame. Call between frames.
    pub fn enroll_from_frame(
        &self,
        bbox: BoundingBox,
        embedding: &Embedding,
        identity_key: &str,
    ) -> Result<Uuid, GalleryError> {
        self.enroller().enroll_from_frame(bbox, embedding, identity_key)
    }

    /// Run the model on `frame`, then process its detections.
    ///
    /// A model failure skips the frame; tracks are left as they were.
    /// `processing_ms` covers inference as well as matching.
    pub fn run_frame(
        &mut self,
        model: &mut dyn FaceModel,
        frame: &VideoFrame,
    ) -> Result<FrameOverlay, PipelineError> {
        let started = Instant::now();
        self.check_order(frame.sequence)?;
        let detections = model
            .detect_and_embed(frame)
            .map_err(|source| PipelineError::Model {
                sequence: frame.sequence,
                source,
            })?;
        Ok(self.apply(frame.sequence, detections, started))
    }

    /// Match and stabilize one frame's detections.
    pub fn process_frame(
        &mut self,
        sequence: u64,
        detections: Vec<Detection>,
    ) -> Result<FrameOverlay, PipelineError> {
        let started = Instant::now();
        self.check_order(sequence)?;
        Ok(self.apply(sequence, detections, started))
    }

    fn apply(&mut self, sequence: u64, detections: Vec<Detection>, started: Instant) -> FrameOverlay {
        self.last_sequence = Some(sequence);

        let gallery = self.store.snapshot();
        let mut observations = Vec::with_capacity(detections.len());
        let mut dropped = 0usize;

        for detection in detections {
            if detection.confidence < self.min_detection_confidence {
                dropped += 1;
                continue;
            }
            match self.matcher.compare(&detection.embedding, &gallery) {
                Ok(result) => observations.push(FaceObservation {
                    bbox: detection.bbox,
                    result,
                }),
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "dropping detection with unusable embedding");
                    dropped += 1;
                }
            }
        }

        let update = self.stabilizer.update(&observations);
        let overlay = FrameOverlay {
            sequence,
            faces: update.tracks,
            expired: update.expired,
            dropped,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        tracing::debug!(
            sequence,
            faces = overlay.faces.len(),
            observed = observations.len(),
            dropped,
            ms = overlay.processing_ms,
            "frame processed"
        );
        overlay
    }

    fn check_order(&self, sequence: u64) -> Result<(), PipelineError> {
        match self.last_sequence {
            Some(last) if sequence <= last => Err(PipelineError::OutOfOrder { sequence, last }),
            _ => Ok(()),
        }
    }
}
