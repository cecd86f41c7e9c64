//! H.264 encoder and FLV/RTMP muxer behind the pipeline's sink contract.
//!
//! One [`FlvRtmpSink`] owns the whole FFmpeg side of a stream: the output
//! format context, the opened H.264 encoder, and the cached pixel-format
//! converter. It is driven by a single encoder thread, so nothing in here
//! needs locking.

mod convert;

use std::sync::Once;

use ffmpeg_next::{
    self as ffmpeg, codec, encoder, format, util::format::Pixel, Dictionary, Packet, Rational,
};
use pipeline::{SinkError, VideoSink};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::convert::PixelConverter;

/// Mux I/O timeout, microseconds. A stuck RTMP endpoint surfaces as a write
/// error after roughly this long instead of wedging the encoder thread.
const RW_TIMEOUT_US: &str = "2000000";

static FFMPEG_INIT: Once = Once::new();

fn ensure_ffmpeg() -> anyhow::Result<()> {
    let mut result = Ok(());
    FFMPEG_INIT.call_once(|| {
        result = ffmpeg::init().map_err(Into::into);
    });
    result
}

/// Streams H.264 video to an RTMP endpoint inside an FLV container.
///
/// Time base is 1/fps with a one-second GOP and no B-frames; the stream gets
/// the global-header flag when the muxer asks for it and a cleared codec tag
/// so FLV tags are written properly.
pub struct FlvRtmpSink {
    url: String,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: usize,
    camera_id: u32,
    state: Option<EncoderState>,
}

struct EncoderState {
    octx: format::context::Output,
    encoder: encoder::video::Encoder,
    stream_index: usize,
    codec_tb: Rational,
    stream_tb: Rational,
    converter: PixelConverter,
}

impl FlvRtmpSink {
    pub fn new(
        url: impl Into<String>,
        width: u32,
        height: u32,
        fps: u32,
        bitrate: usize,
        camera_id: u32,
    ) -> Self {
        Self {
            url: url.into(),
            width,
            height,
            fps,
            bitrate,
            camera_id,
            state: None,
        }
    }

    /// Drain every packet the encoder has ready and mux it.
    fn drain_packets(state: &mut EncoderState) -> Result<(), SinkError> {
        loop {
            let mut packet = Packet::empty();
            match state.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    packet.set_stream(state.stream_index);
                    packet.rescale_ts(state.codec_tb, state.stream_tb);
                    packet
                        .write_interleaved(&mut state.octx)
                        .map_err(|err| SinkError::Fatal(format!("mux write failed: {err}")))?;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    return Ok(())
                }
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(err) => {
                    return Err(SinkError::Frame(format!("encoder receive failed: {err}")))
                }
            }
        }
    }
}

impl VideoSink for FlvRtmpSink {
    fn open(&mut self) -> anyhow::Result<()> {
        ensure_ffmpeg()?;

        let mut io_options = Dictionary::new();
        io_options.set("rw_timeout", RW_TIMEOUT_US);
        io_options.set("flvflags", "no_duration_filesize");
        let mut octx = format::output_as_with(&self.url, "flv", io_options)?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let codec = encoder::find(codec::Id::H264)
            .ok_or_else(|| anyhow::anyhow!("no H.264 encoder available"))?;
        let mut ost = octx.add_stream(codec)?;
        let stream_index = ost.index();

        let mut video = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        video.set_width(self.width);
        video.set_height(self.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(Rational::new(1, self.fps as i32));
        video.set_frame_rate(Some(Rational::new(self.fps as i32, 1)));
        video.set_bit_rate(self.bitrate);
        video.set_gop(self.fps);
        video.set_max_b_frames(0);
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut x264_options = Dictionary::new();
        x264_options.set("preset", "ultrafast");
        x264_options.set("crf", "23");
        let opened = video.open_with(x264_options)?;
        ost.set_parameters(&opened);
        // FLV refuses streams carrying a foreign codec tag.
        unsafe {
            (*(*ost.as_mut_ptr()).codecpar).codec_tag = 0;
        }

        octx.write_header()?;
        let stream_tb = octx
            .stream(stream_index)
            .expect("stream added above")
            .time_base();

        info!(
            "camera {}: streaming {}x{}@{} ({} bps) to {}",
            self.camera_id, self.width, self.height, self.fps, self.bitrate, self.url
        );

        self.state = Some(EncoderState {
            octx,
            encoder: opened,
            stream_index,
            codec_tb: Rational::new(1, self.fps as i32),
            stream_tb,
            converter: PixelConverter::new(self.width, self.height),
        });
        Ok(())
    }

    fn submit(&mut self, frame: Option<&Frame>) -> Result<(), SinkError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| SinkError::Fatal("sink not open".into()))?;

        match frame {
            Some(frame) => {
                let converted = state
                    .converter
                    .convert(frame)
                    .map_err(SinkError::Frame)?;
                converted.set_pts(Some(frame.pts));

                state
                    .encoder
                    .send_frame(converted)
                    .map_err(|err| SinkError::Frame(format!("encoder rejected frame: {err}")))?;
                Self::drain_packets(state)
            }
            None => {
                debug!("camera {}: flushing encoder", self.camera_id);
                state
                    .encoder
                    .send_eof()
                    .map_err(|err| SinkError::Frame(format!("encoder flush failed: {err}")))?;
                Self::drain_packets(state)
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Err(err) = state.octx.write_trailer() {
                warn!("camera {}: writing trailer failed: {err}", self.camera_id);
            }
        }
    }
}

impl Drop for FlvRtmpSink {
    fn drop(&mut self) {
        self.close();
    }
}
