use crossbeam_channel::{Receiver, Sender, TrySendError};
use lookout_core::{
    BoundingBox, EnrollMetadata, Enroller, Embedding, FaceModel, FrameOverlay, GalleryError,
    GalleryStore, Identity, PipelineError, RecognitionPipeline, VideoFrame,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const REQUEST_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("model produces {model} embeddings but the gallery holds {gallery}")]
    ModelMismatch { model: String, gallery: String },
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
    #[error("engine thread exited")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Frames buffered ahead of the worker; the oldest is dropped when full.
    pub frame_queue_capacity: usize,
    pub frame_budget: Duration,
    /// Overlays buffered for the UI; new ones are discarded when full.
    pub overlay_buffer: usize,
}

/// Counters reported when the engine stops.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub processed: u64,
    pub skipped: u64,
    pub over_budget: u64,
    pub frames_dropped: u64,
    pub overlays_dropped: u64,
}

/// Gallery mutations sent from the UI side to the gallery writer thread.
enum GalleryRequest {
    Enroll {
        key: String,
        embedding: Embedding,
        metadata: EnrollMetadata,
        reply: oneshot::Sender<Result<Uuid, GalleryError>>,
    },
    EnrollFromFrame {
        key: String,
        bbox: BoundingBox,
        embedding: Embedding,
        reply: oneshot::Sender<Result<Uuid, GalleryError>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<Result<Identity, GalleryError>>,
    },
    Shutdown,
}

/// Clone-safe handle for gallery requests.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<GalleryRequest>,
}

impl EngineHandle {
    /// Enroll an embedding under `key`, creating the identity if needed.
    pub async fn enroll(
        &self,
        key: &str,
        embedding: Embedding,
        metadata: EnrollMetadata,
    ) -> Result<Uuid, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(GalleryRequest::Enroll {
            key: key.to_string(),
            embedding,
            metadata,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Enroll a face the UI picked out of a live frame.
    pub async fn enroll_from_frame(
        &self,
        bbox: BoundingBox,
        embedding: Embedding,
        key: &str,
    ) -> Result<Uuid, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(GalleryRequest::EnrollFromFrame {
            key: key.to_string(),
            bbox,
            embedding,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Remove identity `key` and all of its embeddings.
    pub async fn remove(&self, key: &str) -> Result<Identity, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(GalleryRequest::Remove {
            key: key.to_string(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    async fn send(&self, request: GalleryRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Producer side of the bounded frame queue.
///
/// Never blocks: when the queue is full the oldest waiting frame is
/// discarded, so the worker always sees the freshest frames in capture order.
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<VideoFrame>,
    evict: Receiver<VideoFrame>,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl FrameSender {
    /// Queue `frame`. Returns `true` if an older frame was dropped for it.
    pub fn submit(&self, mut frame: VideoFrame) -> Result<bool, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ChannelClosed);
        }
        let mut evicted = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    if let Ok(stale) = self.evict.try_recv() {
                        evicted = true;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            dropped = stale.sequence,
                            queued = frame.sequence,
                            "worker behind; dropping oldest frame"
                        );
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(EngineError::ChannelClosed),
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Running engine: frame worker plus gallery writer.
pub struct Engine {
    handle: EngineHandle,
    frames: FrameSender,
    overlays: Receiver<FrameOverlay>,
    stop: Option<Sender<()>>,
    worker: JoinHandle<EngineStats>,
    writer: JoinHandle<Result<(), GalleryError>>,
}

impl Engine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn frame_sender(&self) -> FrameSender {
        self.frames.clone()
    }

    /// Per-frame overlays, in frame order, for the UI to render.
    pub fn overlays(&self) -> Receiver<FrameOverlay> {
        self.overlays.clone()
    }

    /// Stop the engine.
    ///
    /// The frame in flight finishes; queued frames are discarded. Gallery
    /// requests queued before this call are applied, then the gallery is
    /// flushed to disk.
    pub async fn shutdown(mut self) -> Result<EngineStats, EngineError> {
        drop(self.stop.take());
        // Requests already queued are ahead of this marker.
        let _ = self.handle.tx.send(GalleryRequest::Shutdown).await;

        let Engine {
            frames,
            worker,
            writer,
            ..
        } = self;

        let (stats, flushed) = tokio::task::spawn_blocking(move || {
            let stats = worker.join().map_err(|_| EngineError::WorkerPanicked("frame worker"));
            let flushed = writer.join().map_err(|_| EngineError::WorkerPanicked("gallery writer"));
            (stats, flushed)
        })
        .await
        .map_err(|_| EngineError::WorkerPanicked("shutdown"))?;

        let mut stats = stats?;
        flushed??;
        stats.frames_dropped = frames.dropped();
        tracing::info!(
            processed = stats.processed,
            skipped = stats.skipped,
            over_budget = stats.over_budget,
            frames_dropped = stats.frames_dropped,
            overlays_dropped = stats.overlays_dropped,
            "engine stopped"
        );
        Ok(stats)
    }
}

/// Spawn the frame worker and the gallery writer on dedicated OS threads.
///
/// Fails fast if the model's embeddings cannot be compared with the gallery.
pub fn spawn_engine(
    pipeline: RecognitionPipeline,
    model: Box<dyn FaceModel>,
    config: EngineConfig,
) -> Result<Engine, EngineError> {
    let store = Arc::clone(pipeline.store());
    let gallery_version = store.model_version();
    if model.model_version() != gallery_version {
        return Err(EngineError::ModelMismatch {
            model: model.model_version().to_string(),
            gallery: gallery_version,
        });
    }

    let (frame_tx, frame_rx) = crossbeam_channel::bounded::<VideoFrame>(config.frame_queue_capacity.max(1));
    let (overlay_tx, overlay_rx) = crossbeam_channel::bounded::<FrameOverlay>(config.overlay_buffer.max(1));
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
    let (req_tx, req_rx) = mpsc::channel::<GalleryRequest>(REQUEST_QUEUE_DEPTH);

    let writer = std::thread::Builder::new()
        .name("lookout-gallery".into())
        .spawn({
            let enroller = pipeline.enroller();
            move || run_gallery_writer(enroller, req_rx)
        })
        .map_err(|source| EngineError::Spawn {
            name: "gallery writer",
            source,
        })?;

    let frames = FrameSender {
        tx: frame_tx,
        evict: frame_rx.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
        closed: Arc::new(AtomicBool::new(false)),
    };

    let budget = config.frame_budget;
    let closed = Arc::clone(&frames.closed);
    let worker = std::thread::Builder::new()
        .name("lookout-engine".into())
        .spawn(move || {
            let stats = run_frame_worker(pipeline, model, frame_rx, stop_rx, overlay_tx, budget);
            closed.store(true, Ordering::Release);
            stats
        })
        .map_err(|source| EngineError::Spawn {
            name: "frame worker",
            source,
        })?;

    tracing::info!(
        identities = store.len(),
        model_version = %store.model_version(),
        queue = config.frame_queue_capacity,
        budget_ms = config.frame_budget.as_millis() as u64,
        "engine started"
    );

    Ok(Engine {
        handle: EngineHandle { tx: req_tx },
        frames,
        overlays: overlay_rx,
        stop: Some(stop_tx),
        worker,
        writer,
    })
}

fn run_frame_worker(
    mut pipeline: RecognitionPipeline,
    mut model: Box<dyn FaceModel>,
    frames: Receiver<VideoFrame>,
    stop: Receiver<()>,
    overlays: Sender<FrameOverlay>,
    budget: Duration,
) -> EngineStats {
    tracing::info!("frame worker started");
    let mut stats = EngineStats::default();

    loop {
        let next = crossbeam_channel::select! {
            recv(stop) -> _ => None,
            recv(frames) -> msg => msg.ok(),
        };
        let Some(frame) = next else {
            break;
        };

        match pipeline.run_frame(model.as_mut(), &frame) {
            Ok(overlay) => {
                stats.processed += 1;
                if overlay.processing_ms > budget.as_secs_f64() * 1000.0 {
                    stats.over_budget += 1;
                    tracing::warn!(
                        sequence = overlay.sequence,
                        ms = overlay.processing_ms,
                        budget_ms = budget.as_millis() as u64,
                        "frame over budget"
                    );
                }
                if let Err(TrySendError::Full(overlay)) = overlays.try_send(overlay) {
                    stats.overlays_dropped += 1;
                    tracing::debug!(sequence = overlay.sequence, "UI behind; overlay discarded");
                }
            }
            Err(PipelineError::Model { sequence, source }) => {
                stats.skipped += 1;
                tracing::warn!(sequence, error = %source, "model failed; skipping frame");
            }
            Err(e @ PipelineError::OutOfOrder { .. }) => {
                stats.skipped += 1;
                tracing::warn!(error = %e, "frame skipped");
            }
        }
    }

    tracing::info!(processed = stats.processed, "frame worker exiting");
    stats
}

fn run_gallery_writer(
    enroller: Enroller,
    mut requests: mpsc::Receiver<GalleryRequest>,
) -> Result<(), GalleryError> {
    tracing::info!("gallery writer started");
    let store: &GalleryStore = enroller.store();

    while let Some(request) = requests.blocking_recv() {
        match request {
            GalleryRequest::Enroll {
                key,
                embedding,
                metadata,
                reply,
            } => {
                let result = store.enroll(&key, &embedding, metadata);
                if let Err(e) = &result {
                    tracing::warn!(key, error = %e, "enroll rejected");
                }
                let _ = reply.send(result);
            }
            GalleryRequest::EnrollFromFrame {
                key,
                bbox,
                embedding,
                reply,
            } => {
                let result = enroller.enroll_from_frame(bbox, &embedding, &key);
                if let Err(e) = &result {
                    tracing::warn!(key, error = %e, "enroll from frame rejected");
                }
                let _ = reply.send(result);
            }
            GalleryRequest::Remove { key, reply } => {
                let result = store.remove(&key);
                if let Err(e) = &result {
                    tracing::warn!(key, error = %e, "remove rejected");
                }
                let _ = reply.send(result);
            }
            GalleryRequest::Shutdown => break,
        }
    }

    let flushed = store.flush();
    match &flushed {
        Ok(()) => tracing::info!(identities = store.len(), "gallery flushed; writer exiting"),
        Err(e) => tracing::error!(error = %e, "final gallery flush failed"),
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::{Detection, ModelError, RecognitionConfig, ValidationError};

    const VERSION: &str = "test-model";

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding::new(values, VERSION)
    }

    fn detection(values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox::new(10.0, 10.0, 80.0, 80.0),
            confidence: 0.95,
            embedding: emb(values),
        }
    }

    struct StubModel {
        version: &'static str,
        fail_on: Option<u64>,
        values: Vec<f32>,
        delay: Duration,
    }

    impl FaceModel for StubModel {
        fn detect_and_embed(&mut self, frame: &VideoFrame) -> Result<Vec<Detection>, ModelError> {
            std::thread::sleep(self.delay);
            if self.fail_on == Some(frame.sequence) {
                return Err(ModelError::InferenceFailed("stub failure".into()));
            }
            Ok(vec![detection(self.values.clone())])
        }

        fn model_version(&self) -> &str {
            self.version
        }
    }

    fn recognition() -> RecognitionConfig {
        RecognitionConfig {
            stabilization_window: 1,
            model_version: VERSION.to_string(),
            embedding_dim: 3,
            ..RecognitionConfig::default()
        }
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            frame_queue_capacity: 2,
            frame_budget: Duration::from_millis(33),
            overlay_buffer: 8,
        }
    }

    fn start(store: Arc<GalleryStore>, fail_on: Option<u64>) -> Engine {
        let pipeline = RecognitionPipeline::new(store, &recognition());
        let model = StubModel {
            version: VERSION,
            fail_on,
            values: vec![1.0, 0.0, 0.0],
            delay: Duration::ZERO,
        };
        spawn_engine(pipeline, Box::new(model), engine_config()).unwrap()
    }

    fn alice_store() -> Arc<GalleryStore> {
        let store = Arc::new(GalleryStore::in_memory(VERSION, 3));
        store.enroll("alice", &emb(vec![1.0, 0.0, 0.0]), EnrollMetadata::now()).unwrap();
        store
    }

    fn next_overlay(rx: &Receiver<FrameOverlay>) -> FrameOverlay {
        rx.recv_timeout(Duration::from_secs(5)).expect("overlay within timeout")
    }

    #[tokio::test]
    async fn test_frames_produce_labelled_overlays() {
        let engine = start(alice_store(), None);
        let frames = engine.frame_sender();
        let overlays = engine.overlays();

        for seq in 0..3 {
            frames.submit(VideoFrame::new(seq, 4, 4, vec![])).unwrap();
            let overlay = next_overlay(&overlays);
            assert_eq!(overlay.sequence, seq);
            assert_eq!(overlay.faces.len(), 1);
            assert_eq!(overlay.faces[0].label.as_deref(), Some("alice"));
        }

        let stats = engine.shutdown().await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.skipped, 0);
    }

    #[tokio::test]
    async fn test_slow_inference_counts_against_budget() {
        let pipeline = RecognitionPipeline::new(alice_store(), &recognition());
        let model = StubModel {
            version: VERSION,
            fail_on: None,
            values: vec![1.0, 0.0, 0.0],
            delay: Duration::from_millis(80),
        };
        let engine = spawn_engine(pipeline, Box::new(model), engine_config()).unwrap();
        let overlays = engine.overlays();

        engine.frame_sender().submit(VideoFrame::new(0, 4, 4, vec![])).unwrap();
        let overlay = next_overlay(&overlays);
        assert!(overlay.processing_ms >= 80.0);

        let stats = engine.shutdown().await.unwrap();
        assert_eq!(stats.over_budget, 1);
    }

    #[tokio::test]
    async fn test_model_failure_skips_frame_and_worker_survives() {
        let engine = start(alice_store(), Some(1));
        let frames = engine.frame_sender();
        let overlays = engine.overlays();

        frames.submit(VideoFrame::new(0, 4, 4, vec![])).unwrap();
        assert_eq!(next_overlay(&overlays).sequence, 0);
        frames.submit(VideoFrame::new(1, 4, 4, vec![])).unwrap();
        frames.submit(VideoFrame::new(2, 4, 4, vec![])).unwrap();
        assert_eq!(next_overlay(&overlays).sequence, 2);

        let stats = engine.shutdown().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_enroll_from_frame_is_flushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let store = Arc::new(GalleryStore::open(&path, VERSION, 3).unwrap());
        let engine = start(store, None);
        let handle = engine.handle();

        let bbox = BoundingBox::new(5.0, 5.0, 40.0, 40.0);
        handle
            .enroll_from_frame(bbox, emb(vec![0.0, 1.0, 0.0]), "bob")
            .await
            .unwrap();
        handle
            .enroll("carol", emb(vec![0.0, 0.0, 1.0]), EnrollMetadata::now().with_source("upload"))
            .await
            .unwrap();
        engine.shutdown().await.unwrap();

        let reopened = GalleryStore::open(&path, VERSION, 3).unwrap();
        let bob = reopened.get("bob").unwrap();
        assert_eq!(bob.references[0].metadata.source_box, Some(bbox));
        assert!(reopened.get("carol").is_some());
    }

    #[tokio::test]
    async fn test_invalid_enroll_is_rejected() {
        let engine = start(alice_store(), None);
        let handle = engine.handle();

        let err = handle
            .enroll("dave", emb(vec![1.0, 0.0]), EnrollMetadata::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Gallery(GalleryError::Validation(ValidationError::DimensionMismatch { .. }))
        ));

        let err = handle.remove("nobody").await.unwrap_err();
        assert!(matches!(err, EngineError::Gallery(GalleryError::NotFound(_))));

        let removed = handle.remove("alice").await.unwrap();
        assert_eq!(removed.key, "alice");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let engine = start(alice_store(), None);
        let handle = engine.handle();
        let frames = engine.frame_sender();
        engine.shutdown().await.unwrap();

        assert!(matches!(handle.remove("alice").await, Err(EngineError::ChannelClosed)));
        assert!(matches!(
            frames.submit(VideoFrame::new(0, 4, 4, vec![])),
            Err(EngineError::ChannelClosed)
        ));
    }

    #[test]
    fn test_model_version_mismatch_fails_fast() {
        let pipeline = RecognitionPipeline::new(alice_store(), &recognition());
        let model = StubModel {
            version: "other-model",
            fail_on: None,
            values: vec![1.0, 0.0, 0.0],
            delay: Duration::ZERO,
        };
        let err = spawn_engine(pipeline, Box::new(model), engine_config()).err().unwrap();
        assert!(matches!(err, EngineError::ModelMismatch { .. }));
    }

    #[test]
    fn test_full_queue_drops_oldest_frame() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let sender = FrameSender {
            tx,
            evict: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };

        assert!(!sender.submit(VideoFrame::new(0, 1, 1, vec![])).unwrap());
        assert!(!sender.submit(VideoFrame::new(1, 1, 1, vec![])).unwrap());
        assert!(sender.submit(VideoFrame::new(2, 1, 1, vec![])).unwrap());
        assert_eq!(sender.dropped(), 1);

        let queued: Vec<u64> = rx.try_iter().map(|f| f.sequence).collect();
        assert_eq!(queued, vec![1, 2]);
    }
}
