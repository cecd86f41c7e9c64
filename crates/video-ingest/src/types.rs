//! Shared data types exposed by the video ingest layer.

use anyhow::Error;
use thiserror::Error;

/// One captured image moving through the pipeline.
///
/// A frame owns its pixel buffer outright; stages hand frames to each other
/// by move, so exactly one stage can touch the buffer at any time. Dropping
/// the frame releases the buffer.
pub struct Frame {
    /// Frame pixel buffer in the layout declared by [`Frame::format`].
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per pixel row, including any padding.
    pub stride: usize,
    /// Format descriptor explaining how to interpret [`Frame::data`].
    pub format: PixelFormat,
    /// Presentation timestamp in units of 1/fps, strictly increasing per
    /// device. Assigned by the capture adapter and preserved end to end.
    pub pts: i64,
    /// Wall-clock capture timestamp in milliseconds, for latency logs only.
    pub timestamp_ms: i64,
    /// Logical camera index stamped on log lines.
    pub camera_id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Supported pixel formats emitted by the capture layer.
pub enum PixelFormat {
    /// Packed RGB, 3 bytes per pixel.
    Rgb24,
    /// Packed BGR, 3 bytes per pixel.
    Bgr24,
    /// Packed YUV 4:2:2, 2 bytes per pixel, as delivered by most UVC cameras.
    Yuyv422,
    /// Single-channel luma.
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel for the packed formats above.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv422 => 2,
            PixelFormat::Gray8 => 1,
        }
    }

    /// Short name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Yuyv422 => "yuyv422",
            PixelFormat::Gray8 => "gray8",
        }
    }
}

#[derive(Debug, Error)]
/// Errors that can arise while configuring or driving capture devices.
pub enum CaptureError {
    #[error("failed to open video device {device:?}")]
    Open { device: String },
    #[error("device {device:?} rejected {width}x{height} {fourcc}")]
    Format {
        device: String,
        width: u32,
        height: u32,
        fourcc: String,
    },
    #[error("capture not initialized")]
    NotInitialized,
    #[error(transparent)]
    Other(#[from] Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel_matches_layout() {
        assert_eq!(PixelFormat::Rgb24.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Yuyv422.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Gray8.bytes_per_pixel(), 1);
    }
}
