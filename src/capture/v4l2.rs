//! USB cameras through V4L2 with memory-mapped buffers
//!
//! UVC devices expose kernel buffer timestamps but no frame-duration control;
//! the expected interval is left to the pipeline, which approximates it from
//! the negotiated frame rate.

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::{CameraBackend, CameraError, CaptureRequest, NegotiatedMode, SensorMode};
use super::frame::{PixelFormat, RawFrame};

pub struct V4l2Camera {
    name: String,
    path: String,
    device: Device,
    format: PixelFormat,
    buffer_count: u32,
    stream: Option<MmapStream<'static>>,
    negotiated: Option<NegotiatedMode>,
}

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
    }
}

fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"NV12" => Some(PixelFormat::Nv12),
        _ => None,
    }
}

impl V4l2Camera {
    /// Open `path`, or the first capture device found when `None`.
    #[instrument]
    pub fn open(
        alias: &str,
        path: Option<&str>,
        format: PixelFormat,
        buffer_count: u32,
    ) -> Result<Self, CameraError> {
        let path = match path {
            Some(path) => path.to_string(),
            None => crate::utils::auto_detect_devices()?
                .into_iter()
                .next()
                .ok_or(CameraError::NoDevice)?
                .path,
        };

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({}) at {}", caps.card, caps.driver, path);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::Device(format!("{path} doesn't support video capture")));
        }

        Ok(Self {
            name: format!("{alias} (v4l2 {path})"),
            path,
            device,
            format,
            buffer_count: buffer_count.max(2),
            stream: None,
            negotiated: None,
        })
    }

    fn best_interval_fps(&self, mode: SensorMode) -> Vec<f64> {
        let Ok(intervals) = self
            .device
            .enum_frameintervals(fourcc(self.format), mode.width, mode.height)
        else {
            return Vec::new();
        };
        intervals
            .into_iter()
            .filter_map(|i| match i.interval {
                FrameIntervalEnum::Discrete(f) if f.numerator > 0 => {
                    Some(f.denominator as f64 / f.numerator as f64)
                }
                _ => None,
            })
            .collect()
    }
}

impl CameraBackend for V4l2Camera {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_modes(&self) -> Vec<SensorMode> {
        match self.device.enum_framesizes(fourcc(self.format)) {
            Ok(sizes) => sizes
                .into_iter()
                .filter_map(|s| match s.size {
                    FrameSizeEnum::Discrete(d) => Some(SensorMode::new(d.width, d.height)),
                    FrameSizeEnum::Stepwise(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!("{}: cannot enumerate frame sizes: {}", self.path, e);
                Vec::new()
            }
        }
    }

    fn configure(&mut self, request: &CaptureRequest) -> Result<NegotiatedMode, CameraError> {
        let mut fmt = self.device.format()?;
        fmt.width = request.mode.width;
        fmt.height = request.mode.height;
        fmt.fourcc = fourcc(request.format);

        let fmt = match self.device.set_format(&fmt) {
            Ok(fmt) => fmt,
            Err(e) => {
                warn!("{}: failed to set format: {}", self.path, e);
                self.device.format()?
            }
        };
        let format = pixel_format(fmt.fourcc).ok_or(CameraError::Device(format!(
            "{} settled on unsupported fourcc {}",
            self.path, fmt.fourcc
        )))?;
        self.format = format;

        let mode = SensorMode::new(fmt.width, fmt.height);
        let available = self.best_interval_fps(mode);
        if !available.is_empty() && !available.iter().any(|f| (f - request.fps).abs() < 0.5) {
            warn!(
                "{}: {:.1} fps not offered at {}x{} (have {:?})",
                self.path, request.fps, mode.width, mode.height, available
            );
        }

        if request.fps > 0.0 {
            let params = Parameters::with_fps(request.fps.round() as u32);
            if let Err(e) = self.device.set_params(&params) {
                warn!("{}: failed to set fps: {}", self.path, e);
            }
        }
        let fps = match self.device.params() {
            Ok(p) if p.interval.numerator > 0 => {
                p.interval.denominator as f64 / p.interval.numerator as f64
            }
            _ => request.fps,
        };

        let negotiated = NegotiatedMode { mode, fps, format };
        info!("{}: negotiated {:?}", self.path, negotiated);
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    fn start(&mut self) -> Result<(), CameraError> {
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.buffer_count
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        // Dropping the stream issues STREAMOFF and unmaps the buffers
        self.stream = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
        let negotiated = self.negotiated.ok_or(CameraError::NotStarted)?;
        let stream = self.stream.as_mut().ok_or(CameraError::NotStarted)?;

        let (buf, meta) = stream.next().map_err(|e| CameraError::Read(e.to_string()))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };

        let sec = u64::try_from(meta.timestamp.sec).unwrap_or(0);
        let usec = u64::try_from(meta.timestamp.usec).unwrap_or(0);
        let sensor_timestamp_ns = (sec > 0 || usec > 0).then(|| sec * 1_000_000_000 + usec * 1_000);

        Ok(RawFrame {
            data: bytes::Bytes::copy_from_slice(&buf[..used]),
            width: negotiated.mode.width,
            height: negotiated.mode.height,
            format: negotiated.format,
            sensor_timestamp_ns,
            frame_duration_ns: None,
        })
    }
}
