//! V4L2-backed camera capture.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::{
    convert::yuyv_to_rgb24,
    types::{CaptureError, Frame, PixelFormat},
    CaptureSource, FrameCallback,
};

const BUFFER_COUNT: u32 = 4;

/// Camera capture over V4L2 memory-mapped streaming I/O.
///
/// The device is negotiated to YUYV at the configured geometry and frames
/// are handed to the callback as packed RGB24, which is what the inference
/// models and the encoder's converter expect. One pts tick is assigned per
/// dequeued buffer.
pub struct V4l2Capture {
    path: String,
    width: u32,
    height: u32,
    fps: u32,
    camera_id: u32,
    device: Option<Device>,
    src_stride: usize,
    callback: Option<FrameCallback>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl V4l2Capture {
    pub fn new(path: impl Into<String>, width: u32, height: u32, fps: u32, camera_id: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
            fps,
            camera_id,
            device: None,
            src_stride: 0,
            callback: None,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl CaptureSource for V4l2Capture {
    fn initialize(&mut self) -> Result<(), CaptureError> {
        let device = Device::with_path(&self.path).map_err(|err| {
            warn!("camera {}: open {} failed: {err}", self.camera_id, self.path);
            CaptureError::Open {
                device: self.path.clone(),
            }
        })?;

        let caps = device.query_caps().map_err(|e| CaptureError::Other(e.into()))?;
        info!(
            "camera {}: {} ({}) on {}",
            self.camera_id, caps.card, caps.driver, self.path
        );
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Open {
                device: self.path.clone(),
            });
        }

        let mut fmt = device.format().map_err(|e| CaptureError::Other(e.into()))?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = FourCC::new(b"YUYV");
        let actual = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Other(e.into()))?;

        if actual.fourcc != FourCC::new(b"YUYV")
            || actual.width != self.width
            || actual.height != self.height
        {
            return Err(CaptureError::Format {
                device: self.path.clone(),
                width: self.width,
                height: self.height,
                fourcc: actual.fourcc.to_string(),
            });
        }

        if let Err(err) = device.set_params(&Parameters::with_fps(self.fps)) {
            // Plenty of drivers reject frame-interval tuning; the stream
            // still runs at whatever the device delivers.
            debug!("camera {}: fps request ignored: {err}", self.camera_id);
        }

        self.src_stride = if actual.stride > 0 {
            actual.stride as usize
        } else {
            self.width as usize * 2
        };
        self.device = Some(device);
        Ok(())
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        let device = self.device.take().ok_or(CaptureError::NotInitialized)?;
        let mut callback = self.callback.take().ok_or(CaptureError::NotInitialized)?;

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let width = self.width as usize;
        let height = self.height as usize;
        let camera_id = self.camera_id;
        let path = self.path.clone();
        let src_stride = self.src_stride.max(width * 2);

        let handle = thread::Builder::new()
            .name(format!("v4l2-capture-{camera_id}"))
            .spawn(move || {
                let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
                {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!("camera {camera_id}: mmap stream on {path} failed: {err}");
                        return;
                    }
                };

                let mut pts: i64 = 0;
                let min_bytes = src_stride * (height - 1) + width * 2;

                while running.load(Ordering::Relaxed) {
                    let (buf, _meta) = match stream.next() {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!("camera {camera_id}: capture read failed: {err}");
                            break;
                        }
                    };
                    if buf.len() < min_bytes {
                        warn!(
                            "camera {camera_id}: short buffer ({} < {min_bytes}), frame skipped",
                            buf.len()
                        );
                        continue;
                    }

                    let mut rgb = Vec::new();
                    yuyv_to_rgb24(buf, src_stride, width, height, &mut rgb);

                    let frame = Frame {
                        data: rgb,
                        width: width as u32,
                        height: height as u32,
                        stride: width * 3,
                        format: PixelFormat::Rgb24,
                        pts,
                        timestamp_ms: Utc::now().timestamp_millis(),
                        camera_id,
                    };
                    pts += 1;

                    callback(frame);
                }
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

impl Drop for V4l2Capture {
    fn drop(&mut self) {
        self.stop();
    }
}
