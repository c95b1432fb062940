use crate::matcher::CosineMatcher;
use crate::stabilizer::StabilizerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// ArcFace w600k_r50, the model the default gallery is built for.
pub const DEFAULT_MODEL_VERSION: &str = "w600k_r50";
pub const DEFAULT_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        min: f32,
        max: f32,
        value: f32,
    },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("model_version must not be empty")]
    EmptyModelVersion,
}

/// Recognition tuning shared by the daemon and the CLI.
///
/// The thresholds are model-specific; calibrate them against the embedding
/// model in use rather than trusting the defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Minimum cosine similarity for a positive match.
    pub acceptance_threshold: f32,
    /// Score gap under which two identities are reported as ambiguous.
    pub ambiguity_epsilon: f32,
    /// Observations a track needs before its label is shown (K).
    pub stabilization_window: usize,
    /// Frames a track may go unseen before it expires.
    pub track_expiry_frames: u32,
    /// Minimum IoU to continue an existing track.
    pub min_overlap: f32,
    /// Detections below this detector confidence are discarded.
    pub min_detection_confidence: f32,
    pub model_version: String,
    pub embedding_dim: usize,
    pub gallery_path: PathBuf,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.40,
            ambiguity_epsilon: 0.02,
            stabilization_window: 5,
            track_expiry_frames: 10,
            min_overlap: 0.3,
            min_detection_confidence: 0.3,
            model_version: DEFAULT_MODEL_VERSION.to_string(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            gallery_path: default_gallery_path(),
        }
    }
}

impl RecognitionConfig {
    /// Override fields from `LOOKOUT_*` environment variables.
    pub fn with_env(mut self) -> Self {
        self.acceptance_threshold = env_parse("LOOKOUT_ACCEPTANCE_THRESHOLD", self.acceptance_threshold);
        self.ambiguity_epsilon = env_parse("LOOKOUT_AMBIGUITY_EPSILON", self.ambiguity_epsilon);
        self.stabilization_window =
            env_parse("LOOKOUT_STABILIZATION_WINDOW", self.stabilization_window);
        self.track_expiry_frames = env_parse("LOOKOUT_TRACK_EXPIRY_FRAMES", self.track_expiry_frames);
        self.min_overlap = env_parse("LOOKOUT_MIN_OVERLAP", self.min_overlap);
        self.min_detection_confidence =
            env_parse("LOOKOUT_MIN_DETECTION_CONFIDENCE", self.min_detection_confidence);
        self.embedding_dim = env_parse("LOOKOUT_EMBEDDING_DIM", self.embedding_dim);
        if let Ok(v) = std::env::var("LOOKOUT_MODEL_VERSION") {
            self.model_version = v;
        }
        if let Ok(v) = std::env::var("LOOKOUT_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("acceptance_threshold", self.acceptance_threshold, -1.0, 1.0)?;
        check_range("ambiguity_epsilon", self.ambiguity_epsilon, 0.0, 2.0)?;
        check_range("min_overlap", self.min_overlap, 0.0, 1.0)?;
        check_range("min_detection_confidence", self.min_detection_confidence, 0.0, 1.0)?;
        if self.stabilization_window == 0 {
            return Err(ConfigError::Zero("stabilization_window"));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Zero("embedding_dim"));
        }
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::EmptyModelVersion);
        }
        Ok(())
    }

    pub fn matcher(&self) -> CosineMatcher {
        CosineMatcher::new(self.acceptance_threshold, self.ambiguity_epsilon)
    }

    pub fn stabilizer(&self) -> StabilizerConfig {
        StabilizerConfig {
            window: self.stabilization_window,
            expiry_frames: self.track_expiry_frames,
            min_overlap: self.min_overlap,
        }
    }
}

/// `$XDG_DATA_HOME/lookout/gallery.json`, falling back to `~/.local/share`.
pub fn default_gallery_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("lookout")
        .join("gallery.json")
}

/// Parse `key` from the environment, keeping `default` when unset or invalid.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn check_range(name: &'static str, value: f32, min: f32, max: f32) -> Result<(), ConfigError> {
    // Written so that NaN fails too.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, min, max, value })
    }
}
