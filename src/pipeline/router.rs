//! Fan-out of captured frames to the preview and storage queues
//!
//! Preview goes through an integer stride on the capture index and then a
//! wall-clock gate; storage through the saving flag and its own gate. The
//! stride thins the sensor rate, the gates cap the requested rates, and the
//! two drift independently so both are applied.

use std::sync::Arc;

use flume::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::capture::frame::{CapturedFrame, FramePayload};
use crate::registry::CameraId;

use super::gate::FrameGate;
use super::slot::{Counter, RouteSettings, SlotControl, SlotCounters};
use super::timing::{FrameTimingTracker, TimingSample};

/// Depth-1 queue where a newer frame replaces the pending one.
pub struct PreviewQueue {
    tx: flume::Sender<FramePayload>,
    evict: flume::Receiver<FramePayload>,
}

pub fn preview_queue() -> (PreviewQueue, flume::Receiver<FramePayload>) {
    let (tx, rx) = flume::bounded(1);
    (
        PreviewQueue {
            tx,
            evict: rx.clone(),
        },
        rx,
    )
}

impl PreviewQueue {
    /// Returns true when a pending frame was evicted.
    pub fn offer(&self, payload: FramePayload) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => false,
            Err(TrySendError::Full(payload)) => {
                let evicted = self.evict.try_recv().is_ok();
                // The consumer may have taken the old frame meanwhile; either way
                // there is room now unless it raced in again, in which case the
                // newer frame is simply lost.
                let _ = self.tx.try_send(payload);
                evicted
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Skipped,
    Admitted,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub capture_index: u64,
    pub preview: Admission,
    pub storage: Admission,
}

pub struct FrameRouter {
    alias: CameraId,
    control: Arc<SlotControl>,
    applied: Arc<RouteSettings>,
    preview_gate: FrameGate,
    storage_gate: FrameGate,
    timing: FrameTimingTracker,
    capture_index: u64,
    preview: PreviewQueue,
    storage_tx: flume::Sender<FramePayload>,
    counters: Arc<SlotCounters>,
}

impl FrameRouter {
    pub fn new(
        alias: CameraId,
        control: Arc<SlotControl>,
        nominal_fps: f64,
        preview: PreviewQueue,
        storage_tx: flume::Sender<FramePayload>,
        counters: Arc<SlotCounters>,
    ) -> Self {
        let applied = control.settings();
        Self {
            alias,
            preview_gate: FrameGate::from_fps(applied.preview_fps),
            storage_gate: FrameGate::from_fps(applied.save_fps),
            applied,
            control,
            timing: FrameTimingTracker::new(nominal_fps),
            capture_index: 0,
            preview,
            storage_tx,
            counters,
        }
    }

    fn refresh_settings(&mut self) {
        let current = self.control.settings_swap().load();
        if Arc::ptr_eq(&current, &self.applied) {
            return;
        }
        let current = arc_swap::Guard::into_inner(current);

        if current.preview_fps != self.applied.preview_fps {
            self.preview_gate = FrameGate::from_fps(current.preview_fps);
        }
        // A new recording starts with an open gate
        if current.save_fps != self.applied.save_fps || (current.saving && !self.applied.saving) {
            self.storage_gate = FrameGate::from_fps(current.save_fps);
        }
        debug!("{}: routing settings now {:?}", self.alias, current);
        self.applied = current;
    }

    pub fn route(&mut self, frame: CapturedFrame) -> RouteOutcome {
        self.refresh_settings();

        self.capture_index += 1;
        self.counters.incr(Counter::Routed);

        let CapturedFrame {
            raw,
            wall_time,
            monotonic,
        } = frame;

        let timing = self.timing.update(TimingSample {
            sensor_timestamp_ns: raw.sensor_timestamp_ns,
            frame_duration_ns: raw.frame_duration_ns,
            monotonic,
        });
        if timing.dropped_since_last > 0 {
            self.counters.add(Counter::HardwareDropped, timing.dropped_since_last);
        }

        let payload = FramePayload {
            data: raw.data,
            width: raw.width,
            height: raw.height,
            format: raw.format,
            wall_time,
            monotonic,
            hardware_frame_number: timing.hardware_frame_number,
            dropped_since_last: timing.dropped_since_last,
            sensor_timestamp_ns: raw.sensor_timestamp_ns,
            capture_index: self.capture_index,
            fps_estimate: timing.fps,
        };

        let stride = u64::from(self.applied.preview_stride.max(1));
        let preview = if (self.capture_index - 1) % stride == 0 && self.preview_gate.should_emit(monotonic) {
            self.counters.incr(Counter::PreviewOffered);
            if self.preview.offer(payload.clone()) {
                self.counters.incr(Counter::PreviewReplaced);
            }
            Admission::Admitted
        } else {
            Admission::Skipped
        };

        let storage = if self.applied.saving && self.storage_gate.should_emit(monotonic) {
            match self.storage_tx.try_send(payload) {
                Ok(()) => {
                    self.counters.incr(Counter::StorageAdmitted);
                    Admission::Admitted
                }
                Err(_) => {
                    self.counters.incr(Counter::StorageDropped);
                    Admission::Dropped
                }
            }
        } else {
            Admission::Skipped
        };

        RouteOutcome {
            capture_index: self.capture_index,
            preview,
            storage,
        }
    }

    #[instrument(skip_all, fields(camera = %self.alias))]
    pub async fn run(mut self, rx: flume::Receiver<CapturedFrame>, cancel: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv_async() => match frame {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };
            self.route(frame);
        }
        info!(
            "router stopped after {} frames ({} hardware drops)",
            self.capture_index,
            self.timing.total_dropped()
        );
    }
}
