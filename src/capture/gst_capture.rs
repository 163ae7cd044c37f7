//! Sensor capture through a GStreamer source element and an appsink
//!
//! Sensors driven this way (libcamerasrc on CSI boards) stamp each buffer with
//! a PTS from the sensor clock and usually a buffer duration, which feed the
//! timing tracker directly.

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};

use super::backend::{CameraBackend, CameraError, CaptureRequest, NegotiatedMode, SensorMode};
use super::frame::{PixelFormat, RawFrame};

const PULL_TIMEOUT_SECS: u64 = 1;

pub struct GstCamera {
    name: String,
    source: String,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    negotiated: Option<NegotiatedMode>,
}

fn gst_err(e: impl std::fmt::Display) -> CameraError {
    CameraError::Device(e.to_string())
}

fn caps_format(format: PixelFormat) -> Result<&'static str, CameraError> {
    match format {
        PixelFormat::Rgb24 => Ok("RGB"),
        PixelFormat::Bgr24 => Ok("BGR"),
        PixelFormat::Yuyv4 => Ok("YUY2"),
        PixelFormat::Nv12 => Ok("NV12"),
        PixelFormat::Mjpeg => Err(CameraError::UnsupportedFormat(format)),
    }
}

impl GstCamera {
    #[instrument]
    pub fn new(alias: &str, source: &str) -> Result<Self, CameraError> {
        gst::init().map_err(|e| CameraError::Device(format!("GStreamer init failed: {e}")))?;

        let element = source.split_whitespace().next().unwrap_or(source);
        if gst::ElementFactory::find(element).is_none() {
            return Err(CameraError::Device(format!("GStreamer element {element} not installed")));
        }

        Ok(Self {
            name: format!("{alias} (gstreamer {element})"),
            source: source.to_string(),
            pipeline: None,
            appsink: None,
            negotiated: None,
        })
    }

    fn pipeline_string(&self, request: &CaptureRequest) -> Result<String, CameraError> {
        let (num, den) = fps_fraction(request.fps);
        Ok(format!(
            "{} ! video/x-raw,width={},height={},framerate={}/{} ! \
             videoconvert ! video/x-raw,format={} ! \
             appsink name=appsink",
            self.source,
            request.mode.width,
            request.mode.height,
            num,
            den,
            caps_format(request.format)?,
        ))
    }
}

/// Rational framerate for caps, e.g. 29.97 -> 2997/100
fn fps_fraction(fps: f64) -> (u64, u64) {
    if fps.fract().abs() < 1e-6 {
        (fps as u64, 1)
    } else {
        ((fps * 100.0).round() as u64, 100)
    }
}

impl CameraBackend for GstCamera {
    fn name(&self) -> &str {
        &self.name
    }

    // Sensor modes are only known once caps negotiate; report none and let the
    // requested size through.
    fn supported_modes(&self) -> Vec<SensorMode> {
        Vec::new()
    }

    fn configure(&mut self, request: &CaptureRequest) -> Result<NegotiatedMode, CameraError> {
        let description = self.pipeline_string(request)?;
        info!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(gst_err)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CameraError::Device("launch string is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| CameraError::Device("appsink missing from pipeline".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CameraError::Device("appsink element has the wrong type".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let negotiated = NegotiatedMode {
            mode: request.mode,
            fps: request.fps,
            format: request.format,
        };
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    fn start(&mut self) -> Result<(), CameraError> {
        let pipeline = self.pipeline.as_ref().ok_or(CameraError::NotStarted)?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CameraError::Device(format!("failed to start pipeline: {e:?}")))?;

        let (result, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match result {
            Ok(gst::StateChangeSuccess::Success) => info!("Pipeline playing"),
            Ok(gst::StateChangeSuccess::Async) => info!("Pipeline starting asynchronously"),
            Ok(gst::StateChangeSuccess::NoPreroll) => debug!("Live pipeline, no preroll"),
            Err(e) => return Err(CameraError::Device(format!("pipeline did not start: {e:?}"))),
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| CameraError::Device(format!("failed to stop pipeline: {e:?}")))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.stop()?;
        self.appsink = None;
        self.pipeline = None;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
        let appsink = self.appsink.as_ref().ok_or(CameraError::NotStarted)?;
        let negotiated = self.negotiated.ok_or(CameraError::NotStarted)?;

        let sample = appsink
            .try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECS))
            .ok_or_else(|| CameraError::Read("no sample from appsink".into()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CameraError::Read("sample has no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CameraError::Read("failed to map buffer".into()))?;

        let (width, height) = match sample.caps().map(gst_video::VideoInfo::from_caps) {
            Some(Ok(info)) => (info.width(), info.height()),
            _ => {
                warn!("Sample without video caps, assuming negotiated size");
                (negotiated.mode.width, negotiated.mode.height)
            }
        };

        Ok(RawFrame {
            data: Bytes::copy_from_slice(map.as_slice()),
            width,
            height,
            format: negotiated.format,
            sensor_timestamp_ns: buffer.pts().map(|pts| pts.nseconds()),
            frame_duration_ns: buffer.duration().map(|d| d.nseconds()),
        })
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framerate_caps() {
        assert_eq!(fps_fraction(30.0), (30, 1));
        assert_eq!(fps_fraction(29.97), (2997, 100));
    }

    #[test]
    fn mjpeg_is_not_an_appsink_format() {
        assert!(caps_format(PixelFormat::Mjpeg).is_err());
        assert_eq!(caps_format(PixelFormat::Nv12).unwrap(), "NV12");
    }
}
