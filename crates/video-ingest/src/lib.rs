//! Camera capture adapters feeding the streaming pipeline.
//!
//! The crate exposes a small [`CaptureSource`] contract: a source is
//! initialized, given a frame callback, started, and later stopped. Once
//! started it runs its own capture thread and hands every frame to the
//! callback by move — from that point the frame's lifetime belongs to
//! whoever installed the callback. Presentation timestamps are assigned
//! here, one tick of 1/fps per captured frame, strictly increasing for the
//! lifetime of the source.

mod convert;
pub mod synthetic;
pub mod types;
pub mod v4l2;

pub use synthetic::SyntheticCapture;
pub use types::{CaptureError, Frame, PixelFormat};
pub use v4l2::V4l2Capture;

/// Callback invoked with ownership of every captured frame.
pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

/// Contract implemented by every capture adapter.
///
/// Lifecycle is `initialize` → `set_frame_callback` → `start` → `stop`.
/// `stop` is idempotent and joins the capture thread before returning, so
/// no callback invocation can race past it.
pub trait CaptureSource: Send {
    /// Open and configure the underlying device.
    fn initialize(&mut self) -> Result<(), CaptureError>;

    /// Install the sink for captured frames. Must be called before `start`.
    fn set_frame_callback(&mut self, callback: FrameCallback);

    /// Begin producing frames on a background thread.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Stop producing frames and join the capture thread.
    fn stop(&mut self);
}
