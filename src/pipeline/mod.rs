//! Per-camera capture -> route -> preview/storage pipeline

pub mod capture_loop;
pub mod gate;
pub mod metrics;
pub mod preview;
pub mod router;
pub mod slot;
pub mod storage_consumer;
pub mod timing;

pub use gate::FrameGate;
pub use router::{Admission, FrameRouter, PreviewQueue, RouteOutcome};
pub use slot::{CameraSlot, Counter, CounterSnapshot, RouteSettings, SlotControl, SlotCounters};
pub use storage_consumer::{
    FailureReporter, SessionId, StallDetector, StorageConsumer, StorageFailure,
    StorageFailureReason,
};
pub use timing::{FrameTimingTracker, TimingSample, TimingUpdate};

use crate::registry::CameraId;

/// Escalations from slot tasks to the controller.
#[derive(Debug, Clone)]
pub enum SlotEvent {
    /// Sustained read failures past the configured threshold
    CaptureLost { camera: CameraId, reason: String },
    /// First successful read after a `CaptureLost`
    CaptureRecovered { camera: CameraId },
    StorageFailed(StorageFailure),
}
