use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Expected buffer length for an uncompressed frame, `None` for MJPEG.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Yuyv4 => Some(pixels * 2),
            PixelFormat::Nv12 => Some(pixels + pixels / 2),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// One frame as delivered by a camera backend.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Immutable frame data - can be shared across tasks without copying
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Sensor timestamp in nanoseconds, if the driver exposes one
    pub sensor_timestamp_ns: Option<u64>,
    /// Expected inter-frame interval reported by the driver
    pub frame_duration_ns: Option<u64>,
}

/// A raw frame stamped by the capture task.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub raw: RawFrame,
    pub wall_time: DateTime<Utc>,
    /// Time since the controller epoch
    pub monotonic: Duration,
}

/// A routed frame plus everything downstream consumers need to know about it.
///
/// Cloning is cheap: the pixel buffer is reference counted.
#[derive(Debug, Clone)]
pub struct FramePayload {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub wall_time: DateTime<Utc>,
    pub monotonic: Duration,
    pub hardware_frame_number: u64,
    pub dropped_since_last: u64,
    pub sensor_timestamp_ns: Option<u64>,
    /// 1-based index assigned by the router
    pub capture_index: u64,
    /// Frame rate estimate from the timing tracker at this frame
    pub fps_estimate: f64,
}

impl FramePayload {
    pub fn monotonic_ns(&self) -> u64 {
        u64::try_from(self.monotonic.as_nanos()).unwrap_or(u64::MAX)
    }
}
