use tracing::{info, trace};

use super::FrameView;
use crate::capture::frame::FramePayload;
use crate::FpsSnapshot;

/// Headless view that reports through tracing.
#[derive(Debug, Default, Clone)]
pub struct LogView;

impl FrameView for LogView {
    fn show_frame(&self, camera: &str, frame: &FramePayload) {
        trace!(
            "{}: preview #{} ({}x{} {:?})",
            camera,
            frame.capture_index,
            frame.width,
            frame.height,
            frame.format
        );
    }

    fn show_metrics(&self, camera: &str, m: &FpsSnapshot) {
        info!(
            "{}: capture {:.1} fps | process {:.1} | preview {:.1} | storage {:.1} | dropped queue {} hw {} | read errors {}",
            camera,
            m.capture_fps,
            m.process_fps,
            m.preview_fps,
            m.storage_fps,
            m.storage_dropped,
            m.hardware_dropped,
            m.capture_errors
        );
    }

    fn set_status(&self, message: &str) {
        info!("status: {}", message);
    }
}
