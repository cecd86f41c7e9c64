//! Synthetic frame source for tests and hardware-free demos.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::debug;

use crate::{
    types::{CaptureError, Frame, PixelFormat},
    CaptureSource, FrameCallback,
};

/// Generates gradient RGB24 frames at a fixed rate.
///
/// Behaves exactly like a camera adapter from the pipeline's point of view:
/// its own thread, callback ownership transfer, strictly increasing pts.
/// With `frame_limit` set it stops emitting after that many frames but keeps
/// the thread parked until `stop`, mirroring a camera that has gone quiet.
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    fps: u32,
    camera_id: u32,
    frame_limit: Option<u64>,
    callback: Option<FrameCallback>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, fps: u32, camera_id: u32) -> Self {
        Self {
            width,
            height,
            fps,
            camera_id,
            frame_limit: None,
            callback: None,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Stop emitting after `limit` frames.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }
}

impl CaptureSource for SyntheticCapture {
    fn initialize(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        let mut callback = self.callback.take().ok_or(CaptureError::NotInitialized)?;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let width = self.width;
        let height = self.height;
        let camera_id = self.camera_id;
        let frame_limit = self.frame_limit;
        let interval = Duration::from_secs(1) / self.fps.max(1);

        let handle = thread::Builder::new()
            .name(format!("synthetic-capture-{camera_id}"))
            .spawn(move || {
                let mut pts: i64 = 0;
                let mut next_deadline = Instant::now();

                while running.load(Ordering::Relaxed) {
                    if frame_limit.is_some_and(|limit| pts as u64 >= limit) {
                        // Source exhausted; idle until stopped.
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }

                    let frame = Frame {
                        data: gradient(width, height, pts),
                        width,
                        height,
                        stride: width as usize * 3,
                        format: PixelFormat::Rgb24,
                        pts,
                        timestamp_ms: Utc::now().timestamp_millis(),
                        camera_id,
                    };
                    pts += 1;

                    callback(frame);

                    next_deadline += interval;
                    let now = Instant::now();
                    if next_deadline > now {
                        thread::sleep(next_deadline - now);
                    } else {
                        // Callback (queue backpressure) ate the frame budget.
                        next_deadline = now;
                    }
                }

                debug!("synthetic capture {camera_id} emitted {pts} frames");
            })
            .map_err(|e| CaptureError::Other(e.into()))?;

        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cheap per-frame gradient so consecutive frames differ visibly.
fn gradient(width: u32, height: u32, pts: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    let shift = (pts as u32) & 0xff;
    for y in 0..height {
        for x in 0..width {
            data.push(((x + shift) & 0xff) as u8);
            data.push(((y + shift) & 0xff) as u8);
            data.push((shift ^ 0x55) as u8);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn emits_strictly_increasing_pts_up_to_limit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut capture = SyntheticCapture::new(8, 8, 200, 0).with_frame_limit(20);
        capture.initialize().unwrap();
        capture.set_frame_callback(Box::new(move |frame| {
            sink.lock().unwrap().push(frame.pts);
        }));
        capture.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if seen.lock().unwrap().len() >= 20 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        capture.stop();

        let pts = seen.lock().unwrap().clone();
        assert_eq!(pts.len(), 20);
        assert!(pts.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn stop_joins_without_callback_racing() {
        let mut capture = SyntheticCapture::new(4, 4, 1000, 1);
        capture.initialize().unwrap();
        capture.set_frame_callback(Box::new(|_frame| {}));
        capture.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        capture.stop();
        // Second stop is a no-op.
        capture.stop();
    }
}
