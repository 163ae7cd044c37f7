pub mod capture;
pub mod controller;
pub mod display;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod utils;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use capture::synthetic::SyntheticOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub module: ModuleConfig,
    pub cameras: Vec<CaptureConfig>,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Directory name under the session dir, e.g. `Cameras` or `USBCameras`
    pub name: String,
    /// Where sessions go when a recording does not name a directory
    pub session_root: PathBuf,
}

/// Where a camera's frames come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraSource {
    Synthetic(SyntheticOptions),
    /// USB camera through V4L2; `None` picks the first capture device
    V4l2 {
        #[serde(default)]
        device: Option<String>,
        #[serde(default = "default_buffer_count")]
        buffer_count: u32,
    },
    /// Sensor behind a GStreamer source element, e.g. `libcamerasrc`
    Gstreamer {
        #[serde(default = "default_gst_source")]
        source: String,
    },
}

fn default_buffer_count() -> u32 {
    4
}

fn default_gst_source() -> String {
    "libcamerasrc".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub alias: String,
    pub source: CameraSource,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage_queue_depth: usize,
    /// 1, 1/2, 1/3 or 1/4 of captured frames offered to preview
    pub preview_fraction: f64,
    /// Preview rate cap, 0 = unlimited
    pub preview_fps: f64,
    /// Recording rate cap, 0 = unlimited
    pub save_fps: f64,
    pub capture_retry_ms: u64,
    pub capture_failure_threshold: u32,
    pub metrics_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Encoder frame size; the sensor size when unset
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub jpeg_quality: u8,
    /// Write a still every N stored frames, 0 = never
    pub still_every: u64,
    /// Consecutive unwritten frames before the writer counts as stalled
    pub stall_threshold: u32,
}

impl StorageConfig {
    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.target_width.zip(self.target_height)
    }
}

/// Which slots are rebuilt after a storage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinitScope {
    Failed,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub shutdown_timeout_ms: u64,
    pub reinit_scope: ReinitScope,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: "Cameras".into(),
            session_root: PathBuf::from("sessions"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_queue_depth: 8,
            preview_fraction: 1.0,
            preview_fps: 10.0,
            save_fps: 0.0,
            capture_retry_ms: 10,
            capture_failure_threshold: 100,
            metrics_interval_ms: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            target_width: None,
            target_height: None,
            jpeg_quality: 90,
            still_every: 0,
            stall_threshold: 60,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5000,
            reinit_scope: ReinitScope::Failed,
        }
    }
}

impl CaptureConfig {
    pub fn synthetic(alias: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            alias: alias.into(),
            source: CameraSource::Synthetic(SyntheticOptions::default()),
            width,
            height,
            fps,
            format: PixelFormat::Rgb24,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `CAMRIG__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CAMRIG")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Config = builder.build()?.try_deserialize()?;
        if cfg.cameras.is_empty() {
            cfg.cameras.push(CaptureConfig::synthetic("cam0", 640, 480, 30.0));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for cam in &self.cameras {
            if cam.alias.trim().is_empty() {
                return Err(ConfigError::Invalid("camera alias must not be empty".into()));
            }
            if !seen.insert(cam.alias.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate camera alias {:?}", cam.alias)));
            }
            if cam.width == 0 || cam.height == 0 {
                return Err(ConfigError::Invalid(format!("{}: zero frame size", cam.alias)));
            }
            if !(cam.fps.is_finite() && cam.fps > 0.0) {
                return Err(ConfigError::Invalid(format!("{}: fps must be positive", cam.alias)));
            }
        }
        if self.pipeline.storage_queue_depth == 0 {
            return Err(ConfigError::Invalid("storage_queue_depth must be at least 1".into()));
        }
        if self.storage.stall_threshold == 0 {
            return Err(ConfigError::Invalid("stall_threshold must be at least 1".into()));
        }
        if self.storage.target_width.is_some() != self.storage.target_height.is_some() {
            return Err(ConfigError::Invalid(
                "target_width and target_height must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate rates for one camera over the last metrics interval
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FpsSnapshot {
    pub capture_fps: f64,
    pub process_fps: f64,
    pub preview_fps: f64,
    pub storage_fps: f64,
    pub storage_dropped: u64,
    pub hardware_dropped: u64,
    pub capture_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = Config::default();
        cfg.cameras.push(CaptureConfig::synthetic("cam0", 64, 48, 30.0));
        cfg.validate().unwrap();
        assert_eq!(cfg.pipeline.storage_queue_depth, 8);
        assert_eq!(cfg.storage.stall_threshold, 60);
    }

    #[test]
    fn duplicate_aliases_are_rejected() {
        let mut cfg = Config::default();
        cfg.cameras.push(CaptureConfig::synthetic("cam0", 64, 48, 30.0));
        cfg.cameras.push(CaptureConfig::synthetic("cam0", 64, 48, 30.0));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
[module]
name = "USBCameras"

[pipeline]
save_fps = 10.0
preview_fraction = 0.5

[[cameras]]
alias = "left"
width = 320
height = 240
fps = 30.0
format = "yuyv4"
source = { kind = "synthetic", realtime = false }

[[cameras]]
alias = "right"
width = 640
height = 480
fps = 15.0
format = "mjpeg"
source = { kind = "v4l2", device = "/dev/video2" }
"#,
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.module.name, "USBCameras");
        assert_eq!(cfg.pipeline.save_fps, 10.0);
        assert_eq!(cfg.pipeline.storage_queue_depth, 8);
        assert_eq!(cfg.cameras.len(), 2);
        assert!(matches!(
            cfg.cameras[0].source,
            CameraSource::Synthetic(SyntheticOptions { realtime: false, .. })
        ));
        assert!(matches!(
            &cfg.cameras[1].source,
            CameraSource::V4l2 { device: Some(d), buffer_count: 4 } if d == "/dev/video2"
        ));
    }
}
