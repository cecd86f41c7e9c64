//! Consumed interface of the encoder/muxer adapter.

use thiserror::Error;
use video_ingest::Frame;

#[derive(Debug, Error)]
pub enum SinkError {
    /// This frame could not be converted or encoded; the stream continues.
    #[error("frame rejected: {0}")]
    Frame(String),
    /// The sink is unusable (connection lost, muxer dead); the pipeline
    /// must stop.
    #[error("sink failed: {0}")]
    Fatal(String),
}

/// Stateful encoder + muxer fed by the pipeline's encoder thread.
///
/// Exactly one thread calls `submit` after `open` returns, so
/// implementations need no locking on the hot path. `submit(None)` is the
/// end-of-stream sentinel: it flushes any frames buffered inside the
/// encoder. `close` must be safe to call on every exit path, including
/// after a fatal error, and more than once.
pub trait VideoSink: Send {
    /// Open the encoder and the output; called once, before any submit.
    fn open(&mut self) -> anyhow::Result<()>;

    /// Encode and mux one frame, or flush with `None`.
    ///
    /// Successive frames are guaranteed to carry strictly increasing pts.
    fn submit(&mut self, frame: Option<&Frame>) -> Result<(), SinkError>;

    /// Tear down the encoder and the output connection.
    fn close(&mut self);
}
