//! View boundary: where preview frames, FPS metrics and status lines go

pub mod log_view;
pub mod snapshot;

pub use log_view::LogView;
pub use snapshot::SnapshotView;

use crate::capture::frame::FramePayload;
use crate::FpsSnapshot;

/// A sink shared by every slot. Implementations must be quick and must not
/// block; they are called from the preview and metrics tasks.
pub trait FrameView: Send + Sync {
    fn show_frame(&self, camera: &str, frame: &FramePayload);

    fn show_metrics(&self, camera: &str, metrics: &FpsSnapshot);

    fn set_status(&self, message: &str);
}
