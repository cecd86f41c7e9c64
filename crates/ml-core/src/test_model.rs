//! Loopback model used for pipeline bring-up without real weights.

use std::{path::Path, thread, time::Duration};

use tracing::info;
use video_ingest::{Frame, PixelFormat};

use crate::{Model, ModelError};

const SIMULATED_INFERENCE: Duration = Duration::from_millis(60);

/// Simulates a heavyweight model: sleeps for roughly one real inference
/// budget, then swaps the R and B channels in place so the effect is visible
/// on the outgoing stream.
pub struct TestModel {
    delay: Duration,
}

impl TestModel {
    pub fn new() -> Self {
        Self {
            delay: SIMULATED_INFERENCE,
        }
    }
}

impl Default for TestModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for TestModel {
    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        info!("test model loaded (weights at {} ignored)", path.display());
        Ok(())
    }

    fn run(&mut self, frame: &mut Frame) -> Result<(), ModelError> {
        thread::sleep(self.delay);

        match frame.format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                for px in frame.data.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
            }
            // Nothing sensible to do for non-RGB layouts; pass through.
            PixelFormat::Yuyv422 | PixelFormat::Gray8 => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TestModel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(data: Vec<u8>) -> Frame {
        Frame {
            data,
            width: 2,
            height: 1,
            stride: 6,
            format: PixelFormat::Rgb24,
            pts: 0,
            timestamp_ms: 0,
            camera_id: 0,
        }
    }

    #[test]
    fn swaps_channels_in_place() {
        let mut model = TestModel::new();
        model.delay = Duration::ZERO;
        model.load(Path::new("unused")).unwrap();

        let mut frame = rgb_frame(vec![1, 2, 3, 4, 5, 6]);
        model.run(&mut frame).unwrap();
        assert_eq!(frame.data, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn leaves_yuyv_untouched() {
        let mut model = TestModel::new();
        model.delay = Duration::ZERO;

        let mut frame = rgb_frame(vec![9, 9, 9, 9]);
        frame.format = PixelFormat::Yuyv422;
        frame.stride = 4;
        model.run(&mut frame).unwrap();
        assert_eq!(frame.data, vec![9, 9, 9, 9]);
    }
}
