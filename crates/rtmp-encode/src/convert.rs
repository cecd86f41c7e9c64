//! Cached pixel-format conversion in front of the H.264 encoder.

use ffmpeg_next::{
    format::Pixel,
    frame,
    software::scaling,
};
use video_ingest::{Frame, PixelFormat};

/// Map a capture-layer format onto the matching libswscale input format.
pub(crate) fn map_pixel(format: PixelFormat) -> Option<Pixel> {
    match format {
        PixelFormat::Rgb24 => Some(Pixel::RGB24),
        PixelFormat::Bgr24 => Some(Pixel::BGR24),
        PixelFormat::Yuyv422 => Some(Pixel::YUYV422),
        PixelFormat::Gray8 => Some(Pixel::GRAY8),
    }
}

/// Converts incoming frames to YUV420P at the encoder's geometry.
///
/// The scaling context and the staging source frame are built lazily on the
/// first frame and rebuilt whenever the source format or geometry changes;
/// the destination frame is allocated once and reused for every conversion.
pub(crate) struct PixelConverter {
    dst_width: u32,
    dst_height: u32,
    ctx: Option<scaling::Context>,
    src: Option<frame::Video>,
    src_desc: Option<(Pixel, u32, u32)>,
    dst: frame::Video,
}

impl PixelConverter {
    pub(crate) fn new(dst_width: u32, dst_height: u32) -> Self {
        Self {
            dst_width,
            dst_height,
            ctx: None,
            src: None,
            src_desc: None,
            dst: frame::Video::new(Pixel::YUV420P, dst_width, dst_height),
        }
    }

    /// Convert `frame` into the reused YUV420P destination buffer.
    pub(crate) fn convert(&mut self, frame: &Frame) -> Result<&mut frame::Video, String> {
        let pix = map_pixel(frame.format)
            .ok_or_else(|| format!("unsupported source format {}", frame.format.name()))?;

        let desc = (pix, frame.width, frame.height);
        if self.src_desc != Some(desc) {
            let ctx = scaling::Context::get(
                pix,
                frame.width,
                frame.height,
                Pixel::YUV420P,
                self.dst_width,
                self.dst_height,
                scaling::Flags::BILINEAR,
            )
            .map_err(|err| format!("building scaling context: {err}"))?;
            self.ctx = Some(ctx);
            self.src = Some(frame::Video::new(pix, frame.width, frame.height));
            self.src_desc = Some(desc);
        }

        let src = self.src.as_mut().expect("staging frame built above");
        let row_bytes = frame.width as usize * frame.format.bytes_per_pixel();
        let src_stride = src.stride(0);
        let expected = frame.stride * (frame.height as usize - 1) + row_bytes;
        if frame.data.len() < expected {
            return Err(format!(
                "frame buffer too small: {} bytes for {}x{} {}",
                frame.data.len(),
                frame.width,
                frame.height,
                frame.format.name()
            ));
        }

        {
            let data = src.data_mut(0);
            for row in 0..frame.height as usize {
                let from = &frame.data[row * frame.stride..row * frame.stride + row_bytes];
                data[row * src_stride..row * src_stride + row_bytes].copy_from_slice(from);
            }
        }

        self.ctx
            .as_mut()
            .expect("scaling context built above")
            .run(src, &mut self.dst)
            .map_err(|err| format!("pixel conversion failed: {err}"))?;

        Ok(&mut self.dst)
    }

    /// True once a context has been built (test hook).
    #[cfg(test)]
    pub(crate) fn cached_desc(&self) -> Option<(Pixel, u32, u32)> {
        self.src_desc
    }
}
