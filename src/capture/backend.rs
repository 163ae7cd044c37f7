//! Camera driver boundary shared by every capture adapter

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::frame::{PixelFormat, RawFrame};

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("camera not started")]
    NotStarted,
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("no capture device found")]
    NoDevice,
}

/// A native sensor mode the driver can produce without scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMode {
    pub width: u32,
    pub height: u32,
}

impl SensorMode {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn aspect(self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

/// What the pipeline asks a backend for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub mode: SensorMode,
    pub fps: f64,
    pub format: PixelFormat,
}

/// What the backend actually settled on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedMode {
    pub mode: SensorMode,
    pub fps: f64,
    pub format: PixelFormat,
}

/// Narrow capability interface implemented by each camera adapter.
///
/// All methods block; the pipeline calls them from the blocking thread pool.
pub trait CameraBackend: Send + 'static {
    /// Human readable driver name for logs
    fn name(&self) -> &str;

    /// Native modes, empty when the driver cannot enumerate them
    fn supported_modes(&self) -> Vec<SensorMode>;

    fn configure(&mut self, request: &CaptureRequest) -> Result<NegotiatedMode, CameraError>;

    fn start(&mut self) -> Result<(), CameraError>;

    fn stop(&mut self) -> Result<(), CameraError>;

    /// Release driver handles. The backend is not reused afterwards.
    fn close(&mut self) -> Result<(), CameraError> {
        self.stop()
    }

    fn read_frame(&mut self) -> Result<RawFrame, CameraError>;
}

/// Pick the native mode closest to `requested`.
///
/// Exact matches win. Otherwise the smallest area difference is chosen, ties
/// broken by aspect ratio distance. An empty list accepts the request as is.
pub fn select_sensor_mode(requested: SensorMode, supported: &[SensorMode]) -> SensorMode {
    if supported.is_empty() || supported.contains(&requested) {
        return requested;
    }

    let best = supported
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = a.area().abs_diff(requested.area());
            let db = b.area().abs_diff(requested.area());
            da.cmp(&db).then_with(|| {
                let ra = (a.aspect() - requested.aspect()).abs();
                let rb = (b.aspect() - requested.aspect()).abs();
                ra.total_cmp(&rb)
            })
        })
        .unwrap_or(requested);

    warn!(
        "Requested {}x{} is not a native mode, falling back to {}x{}",
        requested.width, requested.height, best.width, best.height
    );
    best
}
