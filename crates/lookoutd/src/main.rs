use anyhow::{Context, Result};
use lookout_core::{RecognitionPipeline, VideoFrame};
use lookoutd::{open_gallery, spawn_engine, Config, ReplayModel};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("lookoutd starting");

    let config = Config::load().context("loading configuration")?;
    let store = Arc::new(open_gallery(&config).context(
        "opening gallery (set LOOKOUT_ALLOW_EMPTY_GALLERY=1 to start empty after corruption)",
    )?);

    let replay_path = config
        .replay_path
        .clone()
        .context("no model backend: set LOOKOUT_REPLAY_PATH to a detections file")?;
    let model = ReplayModel::open(&replay_path, &config.recognition.model_version)?;
    let total = model.len() as u64;
    let scripted: Vec<_> = (0..total)
        .map(|seq| {
            model
                .enroll_requests(seq)
                .into_iter()
                .map(|(req, det)| (req.key.clone(), det.bbox, det.embedding.clone()))
                .collect::<Vec<_>>()
        })
        .collect();

    let pipeline = RecognitionPipeline::new(Arc::clone(&store), &config.recognition);
    let engine = spawn_engine(pipeline, Box::new(model), config.engine())?;

    // Stand-in for the UI: one JSON overlay per line on stdout.
    let overlays = engine.overlays();
    let printer = std::thread::Builder::new()
        .name("lookout-overlay".into())
        .spawn(move || {
            for overlay in overlays {
                match serde_json::to_string(&overlay) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "cannot encode overlay"),
                }
            }
        })
        .context("spawning overlay printer")?;

    tracing::info!(frames = total, fps = config.fps, "lookoutd ready");

    let frames = engine.frame_sender();
    let handle = engine.handle();
    let mut ticker = tokio::time::interval(config.frame_interval());
    let source = async {
        for (seq, requests) in scripted.into_iter().enumerate() {
            ticker.tick().await;
            frames.submit(VideoFrame::new(seq as u64, 0, 0, Vec::new()))?;
            for (key, bbox, embedding) in requests {
                match handle.enroll_from_frame(bbox, embedding, &key).await {
                    Ok(id) => tracing::info!(key, %id, "enrolled from live frame"),
                    Err(e) => tracing::warn!(key, error = %e, "enrollment failed"),
                }
            }
        }
        Ok::<_, lookoutd::EngineError>(())
    };

    tokio::select! {
        result = source => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    tracing::info!("lookoutd shutting down");
    engine.shutdown().await?;
    if printer.join().is_err() {
        tracing::warn!("overlay printer panicked");
    }

    Ok(())
}
