//! Replay backend: pre-computed detections played back as a face model.
//!
//! Each non-empty line of the replay file describes one frame, either as a
//! bare JSON array of detections or as an object that can also carry
//! enrollment requests:
//!
//! ```json
//! {"detections": [{"bbox": {...}, "confidence": 0.9, "embedding": {...}}],
//!  "enroll": [{"detection": 0, "key": "alice"}]}
//! ```

use lookout_core::{Detection, FaceModel, ModelError, VideoFrame};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("cannot read replay file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("replay line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("replay line {line}: enroll refers to detection {index}, frame has {count}")]
    BadEnrollIndex { line: usize, index: usize, count: usize },
}

/// A UI-style "enroll this face" request attached to a replayed frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayEnroll {
    /// Index into the frame's detections.
    pub detection: usize,
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayFrame {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub enroll: Vec<ReplayEnroll>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayLine {
    Bare(Vec<Detection>),
    Frame(ReplayFrame),
}

pub struct ReplayModel {
    frames: Vec<ReplayFrame>,
    model_version: String,
}

impl ReplayModel {
    pub fn open(path: &Path, model_version: &str) -> Result<Self, ReplayError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::parse(&text, model_version)?;
        tracing::info!(
            path = %path.display(),
            frames = model.len(),
            model_version,
            "replay model loaded"
        );
        Ok(model)
    }

    pub fn parse(text: &str, model_version: &str) -> Result<Self, ReplayError> {
        let mut frames = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let line = i + 1;
            let frame = match serde_json::from_str(raw)
                .map_err(|source| ReplayError::Parse { line, source })?
            {
                ReplayLine::Bare(detections) => ReplayFrame {
                    detections,
                    enroll: Vec::new(),
                },
                ReplayLine::Frame(frame) => frame,
            };
            if let Some(bad) = frame.enroll.iter().find(|e| e.detection >= frame.detections.len()) {
                return Err(ReplayError::BadEnrollIndex {
                    line,
                    index: bad.detection,
                    count: frame.detections.len(),
                });
            }
            frames.push(frame);
        }
        Ok(Self {
            frames,
            model_version: model_version.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Enrollment requests scripted for frame `sequence`, with their detections.
    pub fn enroll_requests(&self, sequence: u64) -> Vec<(&ReplayEnroll, &Detection)> {
        usize::try_from(sequence)
            .ok()
            .and_then(|i| self.frames.get(i))
            .map(|frame| {
                frame
                    .enroll
                    .iter()
                    .map(|e| (e, &frame.detections[e.detection]))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl FaceModel for ReplayModel {
    fn detect_and_embed(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>, ModelError> {
        usize::try_from(frame.sequence)
            .ok()
            .and_then(|i| self.frames.get(i))
            .map(|f| f.detections.clone())
            .ok_or(ModelError::FrameUnavailable(frame.sequence))
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }
}
