//! `camrelay` — one camera-to-RTMP inference pipeline per configured camera.

mod config;
mod telemetry;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{bail, Result};
use ml_core::ModelRegistry;
use pipeline::{Pipeline, StreamParams};
use rtmp_encode::FlvRtmpSink;
use tracing::{error, info, warn};
use video_ingest::V4l2Capture;

use crate::config::CameraConfig;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    telemetry::init_tracing();
    let _prometheus = telemetry::init_metrics_recorder();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let config = config::load(&config_path)?;
    info!(
        "loaded {} camera(s) from {}",
        config.camera_configs.len(),
        config_path.display()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let registry = ModelRegistry::with_builtins();
    let mut pipelines = Vec::new();
    for (index, camera) in config.camera_configs.iter().enumerate() {
        match launch_pipeline(index as u32, camera, registry.clone()) {
            Ok(pipeline) => pipelines.push(pipeline),
            Err(err) => {
                // One broken camera must not take down the others.
                error!("camera {index}: pipeline failed to start: {err:?}");
            }
        }
    }
    if pipelines.is_empty() {
        bail!("no pipeline could be started");
    }

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        report_status(&pipelines);
    }

    info!("shutting down {} pipeline(s)", pipelines.len());
    for pipeline in &mut pipelines {
        pipeline.stop();
    }
    drop(pipelines);
    info!("all streams stopped, exiting");
    Ok(())
}

fn launch_pipeline(
    camera_id: u32,
    camera: &CameraConfig,
    registry: ModelRegistry,
) -> Result<Pipeline> {
    let capture = V4l2Capture::new(
        &camera.device,
        camera.width,
        camera.height,
        camera.fps,
        camera_id,
    );
    let sink = FlvRtmpSink::new(
        &camera.rtmp_url,
        camera.width,
        camera.height,
        camera.fps,
        camera.bitrate,
        camera_id,
    );

    let mut params = StreamParams::for_model(camera.model_type, &camera.model_path);
    params.thread_count = camera.thread_count;
    params.model_pool_size = camera.model_pool_size();
    params.camera_id = camera_id;
    if params.model_pool_size < params.thread_count {
        warn!(
            "camera {camera_id}: model pool ({}) smaller than thread count ({}), \
             surplus workers will starve",
            params.model_pool_size, params.thread_count
        );
    }

    let mut pipeline = Pipeline::new(Box::new(capture), Box::new(sink), registry, params);
    pipeline.initialize()?;
    pipeline.start()?;
    Ok(pipeline)
}

fn report_status(pipelines: &[Pipeline]) {
    let active = pipelines.iter().filter(|p| p.is_running()).count();
    info!("running... ({active} of {} streams active)", pipelines.len());
    for pipeline in pipelines {
        let snap = pipeline.stats().snapshot();
        let (input_depth, output_depth) = pipeline.queue_depths();
        info!(
            "  camera {}: captured {} encoded {} dropped {}/{}/{} queues {}/{}",
            pipeline.camera_id(),
            snap.captured,
            snap.encoded,
            snap.dropped_inference,
            snap.dropped_monotonicity,
            snap.dropped_encode,
            input_depth,
            output_depth
        );
    }
}
