pub mod backend;
pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use backend::{select_sensor_mode, CameraBackend, CameraError, CaptureRequest, NegotiatedMode, SensorMode};
pub use frame::{CapturedFrame, FramePayload, PixelFormat, RawFrame};
pub use synthetic::{SyntheticCamera, SyntheticOptions};

use crate::{CameraSource, CaptureConfig};

/// Opens the driver behind a configured camera.
///
/// The controller goes through this for the initial bring-up and every
/// reinit, so tests can swap in scripted cameras.
pub trait BackendFactory: Send + Sync {
    fn open(&self, camera: &CaptureConfig) -> Result<Box<dyn CameraBackend>, CameraError>;
}

/// Maps [`CameraSource`] to the adapters compiled into this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn open(&self, camera: &CaptureConfig) -> Result<Box<dyn CameraBackend>, CameraError> {
        match &camera.source {
            CameraSource::Synthetic(options) => {
                Ok(Box::new(SyntheticCamera::new(camera.alias.clone(), options.clone())))
            }
            #[cfg(feature = "v4l2")]
            CameraSource::V4l2 { device, buffer_count } => Ok(Box::new(v4l2::V4l2Camera::open(
                &camera.alias,
                device.as_deref(),
                camera.format,
                *buffer_count,
            )?)),
            #[cfg(not(feature = "v4l2"))]
            CameraSource::V4l2 { .. } => Err(CameraError::Device(format!(
                "{}: built without the v4l2 feature",
                camera.alias
            ))),
            #[cfg(feature = "gstreamer-pipeline")]
            CameraSource::Gstreamer { source } => {
                Ok(Box::new(gst_capture::GstCamera::new(&camera.alias, source)?))
            }
            #[cfg(not(feature = "gstreamer-pipeline"))]
            CameraSource::Gstreamer { .. } => Err(CameraError::Device(format!(
                "{}: built without the gstreamer-pipeline feature",
                camera.alias
            ))),
        }
    }
}
