//! Test-pattern camera used for headless rigs, demos and tests

use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::{CameraBackend, CameraError, CaptureRequest, NegotiatedMode, SensorMode};
use super::frame::{PixelFormat, RawFrame};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticOptions {
    /// Pace reads to the negotiated frame rate
    pub realtime: bool,
    /// Skip every Nth sensor frame to simulate hardware drops (0 = never)
    pub drop_every: u64,
    /// Fail every Nth read (0 = never)
    pub fail_every: u64,
    /// Native modes advertised to the pipeline
    pub modes: Vec<SensorMode>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            drop_every: 0,
            fail_every: 0,
            modes: vec![
                SensorMode::new(320, 240),
                SensorMode::new(640, 480),
                SensorMode::new(1280, 720),
                SensorMode::new(1920, 1080),
            ],
        }
    }
}

pub struct SyntheticCamera {
    name: String,
    options: SyntheticOptions,
    negotiated: Option<NegotiatedMode>,
    started_at: Option<Instant>,
    sensor_frame: u64,
    reads: u64,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>, options: SyntheticOptions) -> Self {
        Self {
            name: name.into(),
            options,
            negotiated: None,
            started_at: None,
            sensor_frame: 0,
            reads: 0,
        }
    }

    fn interval_ns(fps: f64) -> u64 {
        if fps > 0.0 {
            (1e9 / fps).round() as u64
        } else {
            0
        }
    }

    fn render(&self, negotiated: &NegotiatedMode) -> Result<Bytes, CameraError> {
        let SensorMode { width, height } = negotiated.mode;
        let (w, h) = (width as usize, height as usize);
        let shift = (self.sensor_frame % 256) as usize;

        let mut rgb = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                rgb.push(((x + shift) % 256) as u8);
                rgb.push(((y + shift) % 256) as u8);
                rgb.push(shift as u8);
            }
        }

        let data = match negotiated.format {
            PixelFormat::Rgb24 => rgb,
            PixelFormat::Bgr24 => {
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                rgb
            }
            PixelFormat::Yuyv4 => {
                let mut out = Vec::with_capacity(w * h * 2);
                for pair in rgb.chunks_exact(6) {
                    let (y0, u, v) = rgb_to_yuv(pair[0], pair[1], pair[2]);
                    let (y1, _, _) = rgb_to_yuv(pair[3], pair[4], pair[5]);
                    out.extend_from_slice(&[y0, u, y1, v]);
                }
                out
            }
            PixelFormat::Nv12 => {
                let mut out = vec![0u8; w * h + w * h / 2];
                let (luma, chroma) = out.split_at_mut(w * h);
                for (i, px) in rgb.chunks_exact(3).enumerate() {
                    let (y, u, v) = rgb_to_yuv(px[0], px[1], px[2]);
                    luma[i] = y;
                    let (row, col) = (i / w, i % w);
                    if row % 2 == 0 && col % 2 == 0 {
                        let c = (row / 2) * w + col;
                        if c + 1 < chroma.len() {
                            chroma[c] = u;
                            chroma[c + 1] = v;
                        }
                    }
                }
                out
            }
            PixelFormat::Mjpeg => {
                let mut out = Vec::new();
                JpegEncoder::new_with_quality(&mut out, 85)
                    .encode(&rgb, width, height, ExtendedColorType::Rgb8)
                    .map_err(|e| CameraError::Device(e.to_string()))?;
                out
            }
        };

        Ok(Bytes::from(data))
    }
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
    (
        y.clamp(0.0, 255.0) as u8,
        u.clamp(0.0, 255.0) as u8,
        v.clamp(0.0, 255.0) as u8,
    )
}

impl CameraBackend for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_modes(&self) -> Vec<SensorMode> {
        self.options.modes.clone()
    }

    fn configure(&mut self, request: &CaptureRequest) -> Result<NegotiatedMode, CameraError> {
        let negotiated = NegotiatedMode {
            mode: request.mode,
            fps: if request.fps > 0.0 { request.fps } else { 30.0 },
            format: request.format,
        };
        debug!("{}: configured {:?}", self.name, negotiated);
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if self.negotiated.is_none() {
            return Err(CameraError::Device("start before configure".into()));
        }
        self.started_at = Some(Instant::now());
        self.sensor_frame = 0;
        info!("{}: synthetic stream started", self.name);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        self.started_at = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
        let started_at = self.started_at.ok_or(CameraError::NotStarted)?;
        let negotiated = self.negotiated.ok_or(CameraError::NotStarted)?;

        self.reads += 1;
        if self.options.fail_every > 0 && self.reads % self.options.fail_every == 0 {
            return Err(CameraError::Read(format!("simulated failure on read {}", self.reads)));
        }

        self.sensor_frame += 1;
        if self.options.drop_every > 0 && self.sensor_frame % self.options.drop_every == 0 {
            self.sensor_frame += 1;
        }

        let interval_ns = Self::interval_ns(negotiated.fps);
        let sensor_timestamp_ns = self.sensor_frame * interval_ns;

        if self.options.realtime {
            let due = started_at + Duration::from_nanos(sensor_timestamp_ns);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        Ok(RawFrame {
            data: self.render(&negotiated)?,
            width: negotiated.mode.width,
            height: negotiated.mode.height,
            format: negotiated.format,
            sensor_timestamp_ns: Some(sensor_timestamp_ns),
            frame_duration_ns: (interval_ns > 0).then_some(interval_ns),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(options: SyntheticOptions) -> SyntheticCamera {
        let mut cam = SyntheticCamera::new("synthetic-test", options);
        cam.configure(&CaptureRequest {
            mode: SensorMode::new(8, 4),
            fps: 100.0,
            format: PixelFormat::Yuyv4,
        })
        .unwrap();
        cam.start().unwrap();
        cam
    }

    #[test]
    fn read_before_start_fails() {
        let mut cam = SyntheticCamera::new("idle", SyntheticOptions::default());
        assert!(matches!(cam.read_frame(), Err(CameraError::NotStarted)));
    }

    #[test]
    fn frames_have_expected_size_and_timing() {
        let mut cam = camera(SyntheticOptions {
            realtime: false,
            ..Default::default()
        });
        let a = cam.read_frame().unwrap();
        let b = cam.read_frame().unwrap();
        assert_eq!(a.data.len(), PixelFormat::Yuyv4.frame_len(8, 4).unwrap());
        assert_eq!(a.frame_duration_ns, Some(10_000_000));
        assert_eq!(
            b.sensor_timestamp_ns.unwrap() - a.sensor_timestamp_ns.unwrap(),
            10_000_000
        );
    }

    #[test]
    fn simulated_drop_skips_a_sensor_slot() {
        let mut cam = camera(SyntheticOptions {
            realtime: false,
            drop_every: 3,
            ..Default::default()
        });
        let ts: Vec<u64> = (0..3)
            .map(|_| cam.read_frame().unwrap().sensor_timestamp_ns.unwrap())
            .collect();
        assert_eq!(ts, vec![10_000_000, 20_000_000, 40_000_000]);
    }

    #[test]
    fn simulated_failures_are_reported() {
        let mut cam = camera(SyntheticOptions {
            realtime: false,
            fail_every: 2,
            ..Default::default()
        });
        assert!(cam.read_frame().is_ok());
        assert!(matches!(cam.read_frame(), Err(CameraError::Read(_))));
    }
}
