//! lookoutd — recognition runtime host.
//!
//! Runs the recognition pipeline on a dedicated frame worker fed by a
//! bounded drop-oldest queue, applies gallery mutations on a separate
//! writer thread and hands per-frame overlays to the UI over a channel.

pub mod config;
pub mod engine;
pub mod gallery;
pub mod replay;

pub use config::Config;
pub use engine::{spawn_engine, Engine, EngineConfig, EngineError, EngineHandle, EngineStats, FrameSender};
pub use gallery::open_gallery;
pub use replay::ReplayModel;
