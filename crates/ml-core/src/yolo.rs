//! YOLOv5 object detection over tract-onnx, annotating frames in place.

use std::path::Path;

use tracing::debug;
use tract_onnx::prelude::*;
use tract_onnx::prelude::tract_ndarray::{Array4, Axis, Ix3};
use video_ingest::{Frame, PixelFormat};

use crate::{Model, ModelError};

const INPUT_SIZE: usize = 640;
const CONF_THRESHOLD: f32 = 0.25;
const IOU_THRESHOLD: f32 = 0.45;

type RunnableOnnx = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// YOLOv5 exported to ONNX, run on CPU.
///
/// The raw head output is decoded as `[1, N, 5 + classes]` rows of
/// `cx cy w h obj cls…` in input-pixel coordinates. Surviving boxes are
/// drawn straight onto the frame buffer as 2 px outlines.
pub struct Yolov5 {
    model: Option<RunnableOnnx>,
}

#[derive(Clone, Copy)]
struct Detection {
    bbox: [f32; 4],
    score: f32,
}

impl Yolov5 {
    pub fn new() -> Self {
        Self { model: None }
    }
}

impl Default for Yolov5 {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for Yolov5 {
    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| {
                m.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec![1, 3, INPUT_SIZE, INPUT_SIZE],
                    ),
                )
            })
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|source| ModelError::Load {
                path: path.display().to_string(),
                source,
            })?;

        self.model = Some(model);
        Ok(())
    }

    fn run(&mut self, frame: &mut Frame) -> Result<(), ModelError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| ModelError::Inference(anyhow::anyhow!("model not loaded")))?;

        let tensor = preprocess(frame)?;
        let outputs = model.run(tvec![tensor.into()])?;
        let view = outputs[0]
            .to_array_view::<f32>()?
            .into_dimensionality::<Ix3>()
            .map_err(|err| {
                ModelError::Inference(anyhow::anyhow!("unexpected detection head shape: {err}"))
            })?;

        if view.shape()[0] != 1 || view.shape()[2] < 6 {
            return Err(ModelError::Inference(anyhow::anyhow!(
                "unexpected detection head shape {:?}",
                view.shape()
            )));
        }

        let mut detections = Vec::new();
        for row in view.index_axis(Axis(0), 0).outer_iter() {
            let obj = row[4];
            if obj < CONF_THRESHOLD {
                continue;
            }
            let class_conf = row
                .iter()
                .skip(5)
                .fold(0.0f32, |best, &score| best.max(score));
            let score = obj * class_conf;
            if score < CONF_THRESHOLD {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            detections.push(Detection {
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                score,
            });
        }

        let kept = non_max_suppression(detections);
        debug!(
            "camera {}: frame pts {} -> {} detection(s)",
            frame.camera_id,
            frame.pts,
            kept.len()
        );

        let scale_x = frame.width as f32 / INPUT_SIZE as f32;
        let scale_y = frame.height as f32 / INPUT_SIZE as f32;
        for det in kept {
            draw_box(
                frame,
                (det.bbox[0] * scale_x) as i64,
                (det.bbox[1] * scale_y) as i64,
                (det.bbox[2] * scale_x) as i64,
                (det.bbox[3] * scale_y) as i64,
            );
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "Yolov5"
    }
}

/// Nearest-neighbour resample into a `[1, 3, S, S]` RGB tensor in 0..1.
fn preprocess(frame: &Frame) -> Result<Tensor, ModelError> {
    let (r_off, b_off) = match frame.format {
        PixelFormat::Rgb24 => (0usize, 2usize),
        PixelFormat::Bgr24 => (2, 0),
        other => return Err(ModelError::UnsupportedFormat(other.name())),
    };

    let mut input = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for ty in 0..INPUT_SIZE {
        let sy = ty * frame.height as usize / INPUT_SIZE;
        for tx in 0..INPUT_SIZE {
            let sx = tx * frame.width as usize / INPUT_SIZE;
            let px = sy * frame.stride + sx * 3;
            input[(0, 0, ty, tx)] = f32::from(frame.data[px + r_off]) / 255.0;
            input[(0, 1, ty, tx)] = f32::from(frame.data[px + 1]) / 255.0;
            input[(0, 2, ty, tx)] = f32::from(frame.data[px + b_off]) / 255.0;
        }
    }
    Ok(input.into_tensor())
}

/// Greedy NMS, highest score first.
fn non_max_suppression(mut detections: Vec<Detection>) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::new();
    for det in detections {
        if kept.iter().all(|k| iou(&k.bbox, &det.bbox) < IOU_THRESHOLD) {
            kept.push(det);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// 2 px green outline, clamped to the frame.
fn draw_box(frame: &mut Frame, x1: i64, y1: i64, x2: i64, y2: i64) {
    let w = i64::from(frame.width);
    let h = i64::from(frame.height);
    let (x1, x2) = (x1.clamp(0, w - 1), x2.clamp(0, w - 1));
    let (y1, y2) = (y1.clamp(0, h - 1), y2.clamp(0, h - 1));
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    // Green is symmetric in RGB24 and BGR24.
    let green: [u8; 3] = [0, 255, 0];

    for t in 0..2i64 {
        for x in x1..=x2 {
            put_pixel(frame, x, (y1 + t).min(h - 1), green);
            put_pixel(frame, x, (y2 - t).max(0), green);
        }
        for y in y1..=y2 {
            put_pixel(frame, (x1 + t).min(w - 1), y, green);
            put_pixel(frame, (x2 - t).max(0), y, green);
        }
    }
}

#[inline]
fn put_pixel(frame: &mut Frame, x: i64, y: i64, rgb: [u8; 3]) {
    let idx = y as usize * frame.stride + x as usize * 3;
    frame.data[idx..idx + 3].copy_from_slice(&rgb);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_heavily_overlapping_boxes() {
        let dets = vec![
            Detection {
                bbox: [0.0, 0.0, 10.0, 10.0],
                score: 0.9,
            },
            Detection {
                bbox: [1.0, 1.0, 11.0, 11.0],
                score: 0.8,
            },
            Detection {
                bbox: [50.0, 50.0, 60.0, 60.0],
                score: 0.7,
            },
        ];
        let kept = non_max_suppression(dets);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].score > kept[1].score);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[2.0, 2.0, 3.0, 3.0]), 0.0);
    }

    #[test]
    fn draw_box_stays_in_bounds() {
        let mut frame = Frame {
            data: vec![0u8; 16 * 16 * 3],
            width: 16,
            height: 16,
            stride: 48,
            format: PixelFormat::Rgb24,
            pts: 0,
            timestamp_ms: 0,
            camera_id: 0,
        };
        // Box intentionally larger than the frame.
        draw_box(&mut frame, -5, -5, 100, 100);
        assert_eq!(frame.data[1], 255); // top-left pixel turned green
    }

    #[test]
    fn unloaded_model_reports_inference_error() {
        let mut model = Yolov5::new();
        let mut frame = Frame {
            data: vec![0u8; 4 * 4 * 3],
            width: 4,
            height: 4,
            stride: 12,
            format: PixelFormat::Rgb24,
            pts: 0,
            timestamp_ms: 0,
            camera_id: 0,
        };
        assert!(model.run(&mut frame).is_err());
    }
}
