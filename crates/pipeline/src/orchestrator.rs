//! Wires capture → inference workers → encoder and owns their lifecycle.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use metrics::{counter, gauge};
use ml_core::{ModelKind, ModelRegistry};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureSource, Frame};

use crate::{
    model_pool::ModelPool,
    ordered_queue::{FullPolicy, OrderedQueue},
    sink::{SinkError, VideoSink},
    stats::FrameStats,
    worker_pool::{TaskHandle, WorkerPool},
};

/// Queue waits are short so every thread re-checks the running flag often.
const QUEUE_POP_WAIT: Duration = Duration::from_millis(50);
/// Lease wait doubles as the retry backoff for starved workers.
const MODEL_LEASE_WAIT: Duration = Duration::from_millis(10);
/// Generous bound for inference tasks to wind down after a stop.
const READER_JOIN_WAIT: Duration = Duration::from_secs(2);

const DEFAULT_QUEUE_CAPACITY: usize = 16;
const DEFAULT_THREAD_COUNT: usize = 2;

#[derive(Clone, Debug)]
/// Per-stream tuning shared by the orchestrator and its stages.
pub struct StreamParams {
    pub model_kind: ModelKind,
    pub model_path: PathBuf,
    /// Inference concurrency: number of tasks submitted to the worker pool.
    pub thread_count: usize,
    /// Should equal `thread_count` under the lease-for-life protocol;
    /// smaller pools starve the surplus workers.
    pub model_pool_size: usize,
    /// Logical camera index used in logs and metrics.
    pub camera_id: u32,
    /// Capacity of the input and output frame queues.
    pub queue_capacity: usize,
}

impl StreamParams {
    pub fn for_model(model_kind: ModelKind, model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_kind,
            model_path: model_path.into(),
            thread_count: DEFAULT_THREAD_COUNT,
            model_pool_size: DEFAULT_THREAD_COUNT,
            camera_id: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// One-directional lifecycle of a pipeline.
pub enum PipelineState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// One camera-to-RTMP stream: capture adapter, two ordered queues, a worker
/// pool running the inference stage, and a dedicated encoder thread.
///
/// Frames move by ownership transfer at the queue boundaries, so exactly one
/// stage can touch a buffer at any time and dropping a `Frame` anywhere is
/// the single release mechanism. The encoder thread is the sole consumer of
/// the output queue and enforces strictly increasing pts towards the sink.
pub struct Pipeline {
    params: StreamParams,
    state: PipelineState,
    running: Arc<AtomicBool>,
    input: Arc<OrderedQueue<Frame>>,
    output: Arc<OrderedQueue<Frame>>,
    registry: ModelRegistry,
    capture: Box<dyn CaptureSource>,
    sink: Option<Box<dyn VideoSink>>,
    models: Option<Arc<ModelPool>>,
    workers: Option<WorkerPool>,
    encoder_handle: Option<thread::JoinHandle<Box<dyn VideoSink>>>,
    reader_handles: Vec<TaskHandle<()>>,
    stats: Arc<FrameStats>,
}

impl Pipeline {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        sink: Box<dyn VideoSink>,
        registry: ModelRegistry,
        params: StreamParams,
    ) -> Self {
        let input = Arc::new(OrderedQueue::new(
            params.queue_capacity,
            FullPolicy::Block,
            |frame: &Frame| frame.pts,
        ));
        let output = Arc::new(OrderedQueue::new(
            params.queue_capacity,
            FullPolicy::Block,
            |frame: &Frame| frame.pts,
        ));

        Self {
            params,
            state: PipelineState::Created,
            running: Arc::new(AtomicBool::new(false)),
            input,
            output,
            registry,
            capture,
            sink: Some(sink),
            models: None,
            workers: None,
            encoder_handle: None,
            reader_handles: Vec::new(),
            stats: Arc::new(FrameStats::default()),
        }
    }

    /// Open the capture device and the sink, load the model pool, and start
    /// the worker pool. Idempotent once it has succeeded.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != PipelineState::Created {
            return Ok(());
        }
        let camera = self.params.camera_id;

        self.capture
            .initialize()
            .with_context(|| format!("camera {camera}: capture initialization failed"))?;

        // The callback owns clones of the queue and the ledger, never the
        // pipeline itself, so capture cannot keep the orchestrator alive.
        let input = self.input.clone();
        let stats = self.stats.clone();
        self.capture.set_frame_callback(Box::new(move |frame| {
            stats.captured.fetch_add(1, Ordering::SeqCst);
            counter!("camrelay_frames_captured_total", "camera" => camera.to_string())
                .increment(1);
            match input.push(frame) {
                Ok(()) => {
                    gauge!("camrelay_queue_depth", "queue" => "input").set(input.len() as f64);
                }
                Err(err) => {
                    // Only happens once the queue is closed during stop.
                    stats.drained_on_stop.fetch_add(1, Ordering::SeqCst);
                    drop(err.into_inner());
                }
            }
        }));

        let mut models: Vec<Box<dyn ml_core::Model>> =
            Vec::with_capacity(self.params.model_pool_size);
        for slot in 0..self.params.model_pool_size {
            let mut model = self
                .registry
                .build(self.params.model_kind)
                .with_context(|| {
                    format!(
                        "camera {camera}: no constructor registered for {}",
                        self.params.model_kind.name()
                    )
                })?;
            model
                .load(&self.params.model_path)
                .with_context(|| format!("camera {camera}: loading model slot {slot} failed"))?;
            models.push(model);
        }
        info!(
            "camera {camera}: model pool ready ({} x {})",
            self.params.model_pool_size,
            self.params.model_kind.name()
        );
        self.models = Some(Arc::new(ModelPool::new(models)));

        self.workers = Some(WorkerPool::fixed(
            self.params.thread_count,
            self.params.thread_count,
        ));

        self.sink
            .as_mut()
            .expect("sink present before start")
            .open()
            .with_context(|| format!("camera {camera}: opening encoder sink failed"))?;

        self.state = PipelineState::Initialized;
        Ok(())
    }

    /// Flip the running flag, start capture, submit the inference tasks, and
    /// spawn the encoder thread. No-op when already running.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Running => return Ok(()),
            PipelineState::Created => bail!("start requires initialize"),
            PipelineState::Stopped => {
                warn!("camera {}: start on a stopped pipeline ignored", self.params.camera_id);
                return Ok(());
            }
            PipelineState::Initialized => {}
        }
        let camera = self.params.camera_id;

        self.running.store(true, Ordering::SeqCst);
        if let Err(err) = self.capture.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err).with_context(|| format!("camera {camera}: starting capture failed"));
        }

        let workers = self.workers.as_ref().expect("worker pool initialized");
        let models = self.models.as_ref().expect("model pool initialized").clone();
        for _slot in 0..self.params.thread_count {
            let running = self.running.clone();
            let input = self.input.clone();
            let output = self.output.clone();
            let models = models.clone();
            let stats = self.stats.clone();
            match workers.submit(move || {
                inference_loop(camera, &running, &input, &output, &models, &stats)
            }) {
                Ok(handle) => self.reader_handles.push(handle),
                Err(err) => {
                    // Keep going with fewer inference tasks; dropping the
                    // submission is preferable to wedging startup.
                    warn!("camera {camera}: inference task not scheduled: {err}");
                }
            }
        }

        let sink = self.sink.take().expect("sink present before start");
        let running = self.running.clone();
        let output = self.output.clone();
        let stats = self.stats.clone();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let handle = thread::Builder::new()
            .name(format!("encode-{camera}"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    encoding_loop(camera, &running, &output, sink, &stats)
                })
            })
            .context("failed to spawn encoder thread")?;
        self.encoder_handle = Some(handle);

        self.state = PipelineState::Running;
        info!("camera {camera}: pipeline running");
        Ok(())
    }

    /// Cooperative shutdown: clear the flag, stop capture, let the workers
    /// drain out, join the encoder. No-op unless running.
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        let camera = self.params.camera_id;
        debug!("camera {camera}: stopping pipeline");

        self.running.store(false, Ordering::SeqCst);
        // Closing the queues wakes a capture callback blocked on a full
        // input queue and any worker blocked pushing towards a dead
        // encoder; close keeps queued frames poppable for the drain.
        self.input.close();
        self.output.close();
        self.capture.stop();

        for handle in self.reader_handles.drain(..) {
            if handle.wait_timeout(READER_JOIN_WAIT).is_none() {
                warn!("camera {camera}: inference task did not wind down in time");
            }
        }

        if let Some(handle) = self.encoder_handle.take() {
            match handle.join() {
                Ok(mut sink) => {
                    sink.close();
                    self.sink = Some(sink);
                }
                Err(_) => error!("camera {camera}: encoder thread panicked"),
            }
        }

        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }

        self.drain_queues();
        self.state = PipelineState::Stopped;

        let snap = self.stats.snapshot();
        info!(
            "camera {camera}: stopped (captured {}, encoded {}, dropped {}/{}/{}, drained {})",
            snap.captured,
            snap.encoded,
            snap.dropped_inference,
            snap.dropped_monotonicity,
            snap.dropped_encode,
            snap.drained_on_stop
        );
    }

    /// Free every frame still parked in a queue.
    fn drain_queues(&self) {
        let mut drained = 0u64;
        while let Some(frame) = self.input.pop(Duration::ZERO) {
            drained += 1;
            drop(frame);
        }
        while let Some(frame) = self.output.pop(Duration::ZERO) {
            drained += 1;
            drop(frame);
        }
        if drained > 0 {
            self.stats.drained_on_stop.fetch_add(drained, Ordering::SeqCst);
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// False once the pipeline stopped or hit a fatal sink error.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Arc<FrameStats> {
        self.stats.clone()
    }

    pub fn camera_id(&self) -> u32 {
        self.params.camera_id
    }

    pub fn queue_depths(&self) -> (usize, usize) {
        (self.input.len(), self.output.len())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
        self.drain_queues();
    }
}

/// Inference stage: lease one model for the lifetime of the task, then move
/// frames from the input queue through the model into the output queue.
fn inference_loop(
    camera: u32,
    running: &AtomicBool,
    input: &OrderedQueue<Frame>,
    output: &OrderedQueue<Frame>,
    models: &ModelPool,
    stats: &FrameStats,
) {
    let mut lease_warned = false;

    while running.load(Ordering::Relaxed) {
        let Some(mut model) = models.lease(MODEL_LEASE_WAIT) else {
            if !lease_warned {
                warn!("camera {camera}: no model available, worker waiting");
                lease_warned = true;
            }
            continue;
        };
        debug!("camera {camera}: worker leased {}", model.name());

        while running.load(Ordering::Relaxed) {
            let Some(mut frame) = input.pop(QUEUE_POP_WAIT) else {
                continue;
            };

            match model.run(&mut frame) {
                Ok(()) => match output.push(frame) {
                    Ok(()) => {
                        gauge!("camrelay_queue_depth", "queue" => "output")
                            .set(output.len() as f64);
                    }
                    Err(err) => {
                        // Output closed mid-stop; the frame is reclaimed here.
                        stats.drained_on_stop.fetch_add(1, Ordering::SeqCst);
                        drop(err.into_inner());
                    }
                },
                Err(err) => {
                    stats.dropped_inference.fetch_add(1, Ordering::SeqCst);
                    counter!("camrelay_frames_dropped_total", "reason" => "inference")
                        .increment(1);
                    warn!("camera {camera}: inference failed, frame dropped: {err}");
                }
            }
        }

        models.release(model);
    }
}

/// Encoder stage: single consumer of the output queue, filtering for
/// strictly increasing pts before handing frames to the sink.
fn encoding_loop(
    camera: u32,
    running: &AtomicBool,
    output: &OrderedQueue<Frame>,
    mut sink: Box<dyn VideoSink>,
    stats: &FrameStats,
) -> Box<dyn VideoSink> {
    let mut last_pts = i64::MIN;
    let mut fatal = false;

    while running.load(Ordering::Relaxed) {
        let Some(frame) = output.pop(QUEUE_POP_WAIT) else {
            continue;
        };
        if !encode_one(camera, &mut sink, frame, &mut last_pts, running, stats) {
            fatal = true;
            break;
        }
    }

    if !fatal {
        // Drain what inference completed before the stop, then flush.
        while let Some(frame) = output.pop(Duration::ZERO) {
            if !encode_one(camera, &mut sink, frame, &mut last_pts, running, stats) {
                fatal = true;
                break;
            }
        }
    }
    if !fatal {
        if let Err(err) = sink.submit(None) {
            warn!("camera {camera}: encoder flush failed: {err}");
        }
    }

    sink
}

/// Returns false on a fatal sink error. The frame is consumed either way.
fn encode_one(
    camera: u32,
    sink: &mut Box<dyn VideoSink>,
    frame: Frame,
    last_pts: &mut i64,
    running: &AtomicBool,
    stats: &FrameStats,
) -> bool {
    if frame.pts <= *last_pts {
        stats.dropped_monotonicity.fetch_add(1, Ordering::SeqCst);
        counter!("camrelay_frames_dropped_total", "reason" => "late").increment(1);
        debug!(
            "camera {camera}: dropping late frame pts {} (last submitted {})",
            frame.pts, *last_pts
        );
        return true;
    }

    match sink.submit(Some(&frame)) {
        Ok(()) => {
            *last_pts = frame.pts;
            stats.encoded.fetch_add(1, Ordering::SeqCst);
            counter!("camrelay_frames_encoded_total", "camera" => camera.to_string())
                .increment(1);
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default();
            if frame.pts % 300 == 0 {
                debug!(
                    "camera {camera}: pts {} encoded, capture-to-mux {} ms",
                    frame.pts,
                    now_ms.saturating_sub(frame.timestamp_ms)
                );
            }
            true
        }
        Err(SinkError::Frame(msg)) => {
            stats.dropped_encode.fetch_add(1, Ordering::SeqCst);
            counter!("camrelay_frames_dropped_total", "reason" => "encode").increment(1);
            warn!("camera {camera}: frame pts {} not encoded: {msg}", frame.pts);
            true
        }
        Err(SinkError::Fatal(msg)) => {
            // The frame is consumed here; keep the ledger balanced.
            stats.dropped_encode.fetch_add(1, Ordering::SeqCst);
            error!("camera {camera}: sink failure, stopping pipeline: {msg}");
            running.store(false, Ordering::SeqCst);
            false
        }
    }
}
