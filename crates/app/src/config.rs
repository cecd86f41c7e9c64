//! Configuration parsing for the streaming service.
//!
//! The config file is TOML with an ordered `camera_configs` array; the entry
//! index doubles as the default logical camera id. Required fields that are
//! missing or mistyped surface as errors naming the offending field, wrapped
//! with the file path for context.

use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use ml_core::ModelKind;
use serde::Deserialize;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "config/cameras.toml";

const DEFAULT_BITRATE: usize = 2_000_000;
const DEFAULT_THREAD_COUNT: usize = 2;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub camera_configs: Vec<CameraConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
/// One camera-to-RTMP stream.
pub struct CameraConfig {
    /// V4L2 device path, e.g. `/dev/video0`.
    pub device: String,
    /// Output endpoint, e.g. `rtmp://host/live/cam0`.
    pub rtmp_url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default = "default_bitrate")]
    pub bitrate: usize,
    #[serde(default = "default_model_type")]
    pub model_type: ModelKind,
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Defaults to `thread_count`; models are leased for the lifetime of a
    /// worker, so anything smaller starves the surplus workers.
    pub model_pool_size: Option<usize>,
}

fn default_bitrate() -> usize {
    DEFAULT_BITRATE
}

fn default_model_type() -> ModelKind {
    ModelKind::TestModel
}

fn default_thread_count() -> usize {
    DEFAULT_THREAD_COUNT
}

impl CameraConfig {
    pub fn model_pool_size(&self) -> usize {
        self.model_pool_size.unwrap_or(self.thread_count)
    }
}

/// Load and validate the configuration file.
pub fn load(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;

    if config.camera_configs.is_empty() {
        bail!("config file {} defines no cameras", path.display());
    }
    for (index, camera) in config.camera_configs.iter().enumerate() {
        if camera.width == 0 || camera.height == 0 {
            bail!("camera {index}: width and height must be positive");
        }
        if camera.fps == 0 {
            bail!("camera {index}: fps must be positive");
        }
        if camera.thread_count == 0 {
            bail!("camera {index}: thread_count must be at least 1");
        }
        if camera.model_pool_size() == 0 {
            bail!("camera {index}: model_pool_size must be at least 1");
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<AppConfig> {
        let config: AppConfig = toml::from_str(toml)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
        [[camera_configs]]
        device = "/dev/video0"
        rtmp_url = "rtmp://127.0.0.1/live/cam0"
        width = 1280
        height = 720
        fps = 30
    "#;

    #[test]
    fn minimal_entry_gets_defaults() {
        let config = parse(MINIMAL).unwrap();
        let camera = &config.camera_configs[0];
        assert_eq!(camera.bitrate, 2_000_000);
        assert_eq!(camera.model_type, ModelKind::TestModel);
        assert_eq!(camera.thread_count, 2);
        assert_eq!(camera.model_pool_size(), 2);
    }

    #[test]
    fn missing_required_field_names_it() {
        let err = parse(
            r#"
            [[camera_configs]]
            device = "/dev/video0"
            width = 1280
            height = 720
            fps = 30
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("rtmp_url"), "got: {err}");
    }

    #[test]
    fn mistyped_field_is_rejected() {
        let err = parse(
            r#"
            [[camera_configs]]
            device = "/dev/video0"
            rtmp_url = "rtmp://127.0.0.1/live/cam0"
            width = "wide"
            height = 720
            fps = 30
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("width"), "got: {err}");
    }

    #[test]
    fn explicit_pool_size_can_undersize_the_pool() {
        let config = parse(
            r#"
            [[camera_configs]]
            device = "/dev/video1"
            rtmp_url = "rtmp://127.0.0.1/live/cam1"
            width = 640
            height = 480
            fps = 25
            model_type = "Yolov5"
            model_path = "weights/yolov5s.onnx"
            thread_count = 4
            model_pool_size = 2
            "#,
        )
        .unwrap();
        let camera = &config.camera_configs[0];
        assert_eq!(camera.model_type, ModelKind::Yolov5);
        assert_eq!(camera.model_pool_size(), 2);
    }

    #[test]
    fn config_order_is_preserved() {
        let config = parse(&format!(
            "{MINIMAL}\n[[camera_configs]]\ndevice = \"/dev/video1\"\nrtmp_url = \"rtmp://127.0.0.1/live/cam1\"\nwidth = 640\nheight = 480\nfps = 25\n"
        ))
        .unwrap();
        assert_eq!(config.camera_configs[0].device, "/dev/video0");
        assert_eq!(config.camera_configs[1].device, "/dev/video1");
    }
}
