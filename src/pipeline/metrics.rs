//! Periodic FPS reporting per slot

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::display::FrameView;
use crate::registry::CameraId;
use crate::FpsSnapshot;

use super::slot::{CounterSnapshot, SlotCounters};

fn rate(now: u64, before: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        now.saturating_sub(before) as f64 / secs
    } else {
        0.0
    }
}

pub fn fps_between(now: &CounterSnapshot, before: &CounterSnapshot, elapsed: Duration) -> FpsSnapshot {
    FpsSnapshot {
        capture_fps: rate(now.captured, before.captured, elapsed),
        process_fps: rate(now.routed, before.routed, elapsed),
        preview_fps: rate(now.preview_shown, before.preview_shown, elapsed),
        storage_fps: rate(now.storage_written, before.storage_written, elapsed),
        storage_dropped: now.storage_dropped,
        hardware_dropped: now.hardware_dropped,
        capture_errors: now.capture_errors,
    }
}

fn publish(alias: &CameraId, fps: &FpsSnapshot) {
    let camera = alias.to_string();
    metrics::gauge!("camrig_capture_fps", "camera" => camera.clone()).set(fps.capture_fps);
    metrics::gauge!("camrig_process_fps", "camera" => camera.clone()).set(fps.process_fps);
    metrics::gauge!("camrig_preview_fps", "camera" => camera.clone()).set(fps.preview_fps);
    metrics::gauge!("camrig_storage_fps", "camera" => camera.clone()).set(fps.storage_fps);
    metrics::gauge!("camrig_storage_dropped", "camera" => camera.clone()).set(fps.storage_dropped as f64);
    metrics::gauge!("camrig_hardware_dropped", "camera" => camera).set(fps.hardware_dropped as f64);
}

pub async fn run_metrics(
    alias: CameraId,
    counters: Arc<SlotCounters>,
    view: Arc<dyn FrameView>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    let mut before = counters.snapshot();
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = counters.snapshot();
        let fps = fps_between(&now, &before, last.elapsed());
        last = Instant::now();
        before = now;

        publish(&alias, &fps);
        view.show_metrics(&alias, &fps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_from_counter_deltas() {
        let before = CounterSnapshot {
            captured: 10,
            routed: 10,
            ..Default::default()
        };
        let now = CounterSnapshot {
            captured: 40,
            routed: 40,
            storage_written: 10,
            storage_dropped: 2,
            ..Default::default()
        };
        let fps = fps_between(&now, &before, Duration::from_secs(1));
        assert_eq!(fps.capture_fps, 30.0);
        assert_eq!(fps.process_fps, 30.0);
        assert_eq!(fps.storage_fps, 10.0);
        assert_eq!(fps.storage_dropped, 2);
    }

    #[test]
    fn zero_elapsed_is_zero_rate() {
        let snap = CounterSnapshot::default();
        assert_eq!(fps_between(&snap, &snap, Duration::ZERO).capture_fps, 0.0);
    }
}
