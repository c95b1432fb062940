use crate::engine::EngineConfig;
use lookout_core::config::env_parse;
use lookout_core::RecognitionConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Recognition(#[from] lookout_core::config::ConfigError),
    #[error("frame_queue_capacity must be 1 or 2, got {0}")]
    QueueCapacity(usize),
    #[error("fps must be at least 1")]
    ZeroFps,
}

/// Daemon configuration: an optional TOML file named by `LOOKOUT_CONFIG`,
/// overridden by `LOOKOUT_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub recognition: RecognitionConfig,
    /// Frames buffered between the source and the worker (1–2).
    pub frame_queue_capacity: usize,
    /// Per-frame processing budget; slower frames are logged.
    pub frame_budget_ms: u64,
    /// Overlays buffered for the UI before new ones are discarded.
    pub overlay_buffer: usize,
    /// Replay source frame rate.
    pub fps: u32,
    /// JSON-lines file of pre-computed detections, one line per frame.
    pub replay_path: Option<PathBuf>,
    /// Start with an empty gallery when the gallery file is corrupt.
    pub allow_empty_gallery: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recognition: RecognitionConfig::default(),
            frame_queue_capacity: 2,
            frame_budget_ms: 33,
            overlay_buffer: 8,
            fps: 30,
            replay_path: None,
            allow_empty_gallery: false,
        }
    }
}

impl Config {
    /// Load the optional config file, apply environment overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("LOOKOUT_CONFIG") {
            Ok(path) => Self::from_file(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn with_env(mut self) -> Self {
        self.recognition = self.recognition.with_env();
        self.frame_queue_capacity = env_parse("LOOKOUT_FRAME_QUEUE_CAPACITY", self.frame_queue_capacity);
        self.frame_budget_ms = env_parse("LOOKOUT_FRAME_BUDGET_MS", self.frame_budget_ms);
        self.overlay_buffer = env_parse("LOOKOUT_OVERLAY_BUFFER", self.overlay_buffer);
        self.fps = env_parse("LOOKOUT_FPS", self.fps);
        if let Ok(v) = std::env::var("LOOKOUT_REPLAY_PATH") {
            self.replay_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("LOOKOUT_ALLOW_EMPTY_GALLERY") {
            self.allow_empty_gallery = v != "0";
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recognition.validate()?;
        if !(1..=2).contains(&self.frame_queue_capacity) {
            return Err(ConfigError::QueueCapacity(self.frame_queue_capacity));
        }
        if self.fps == 0 {
            return Err(ConfigError::ZeroFps);
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            frame_queue_capacity: self.frame_queue_capacity,
            frame_budget: Duration::from_millis(self.frame_budget_ms),
            overlay_buffer: self.overlay_buffer.max(1),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            acceptance_threshold = 0.5
            stabilization_window = 7
            gallery_path = "/var/lib/lookout/gallery.json"
            frame_queue_capacity = 1
            fps = 15
            "#,
        )
        .unwrap();

        assert!((config.recognition.acceptance_threshold - 0.5).abs() < 1e-6);
        assert_eq!(config.recognition.stabilization_window, 7);
        assert_eq!(
            config.recognition.gallery_path,
            PathBuf::from("/var/lib/lookout/gallery.json")
        );
        assert_eq!(config.recognition.track_expiry_frames, 10);
        assert_eq!(config.frame_queue_capacity, 1);
        assert_eq!(config.frame_budget_ms, 33);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.frame_queue_capacity, 2);
        assert_eq!(config.fps, 30);
        assert!(!config.allow_empty_gallery);
    }

    #[test]
    fn test_queue_capacity_bounds() {
        let config = Config {
            frame_queue_capacity: 3,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::QueueCapacity(3))));
    }

    #[test]
    fn test_frame_interval() {
        let config = Config {
            fps: 25,
            ..Config::default()
        };
        assert_eq!(config.frame_interval(), Duration::from_millis(40));
    }
}
