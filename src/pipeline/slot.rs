//! Runtime bundle for one physical camera

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::backend::{CameraBackend, NegotiatedMode};
use crate::capture::frame::{CapturedFrame, FramePayload};
use crate::display::FrameView;
use crate::registry::CameraId;
use crate::PipelineConfig;

use super::capture_loop::CaptureLoop;
use super::router::{preview_queue, FrameRouter};
use super::storage_consumer::StorageConsumer;
use super::{metrics, preview, SlotEvent};

/// Routing knobs that may change while the slot is running.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSettings {
    pub preview_stride: u32,
    /// 0 means unlimited
    pub preview_fps: f64,
    /// 0 means unlimited
    pub save_fps: f64,
    pub saving: bool,
}

impl RouteSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            preview_stride: preview_stride(config.preview_fraction),
            preview_fps: config.preview_fps,
            save_fps: config.save_fps,
            saving: false,
        }
    }
}

/// Stride for a preview fraction of 1, 1/2, 1/3 or 1/4.
pub fn preview_stride(fraction: f64) -> u32 {
    if fraction.is_finite() && fraction > 0.0 {
        (1.0 / fraction).round().clamp(1.0, 4.0) as u32
    } else {
        1
    }
}

/// Shared control surface for a slot: hot-swappable settings plus pause.
pub struct SlotControl {
    settings: ArcSwap<RouteSettings>,
    paused: watch::Sender<bool>,
}

impl SlotControl {
    pub fn new(settings: RouteSettings) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            settings: ArcSwap::from_pointee(settings),
            paused,
        }
    }

    pub fn settings(&self) -> Arc<RouteSettings> {
        self.settings.load_full()
    }

    pub(crate) fn settings_swap(&self) -> &ArcSwap<RouteSettings> {
        &self.settings
    }

    fn modify(&self, f: impl Fn(&mut RouteSettings)) {
        self.settings.rcu(|current| {
            let mut next = RouteSettings::clone(current);
            f(&mut next);
            next
        });
    }

    pub fn set_saving(&self, saving: bool) {
        self.modify(|s| s.saving = saving);
    }

    pub fn is_saving(&self) -> bool {
        self.settings.load().saving
    }

    pub fn set_save_fps(&self, fps: f64) {
        self.modify(|s| s.save_fps = fps);
    }

    pub fn set_preview_fps(&self, fps: f64) {
        self.modify(|s| s.preview_fps = fps);
    }

    pub fn set_preview_fraction(&self, fraction: f64) {
        let stride = preview_stride(fraction);
        self.modify(|s| s.preview_stride = stride);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Captured,
    CaptureErrors,
    Routed,
    PreviewOffered,
    PreviewReplaced,
    PreviewShown,
    StorageAdmitted,
    StorageDropped,
    StorageWritten,
    StorageSkipped,
    VideoWriteFailures,
    HardwareDropped,
}

#[derive(Default)]
struct Stats {
    captured: AtomicU64,
    capture_errors: AtomicU64,
    routed: AtomicU64,
    preview_offered: AtomicU64,
    preview_replaced: AtomicU64,
    preview_shown: AtomicU64,
    storage_admitted: AtomicU64,
    storage_dropped: AtomicU64,
    storage_written: AtomicU64,
    storage_skipped: AtomicU64,
    video_write_failures: AtomicU64,
    hardware_dropped: AtomicU64,
}

/// Telemetry counters. Each counter has a single writing task; readers
/// tolerate slightly stale values.
#[derive(Default)]
pub struct SlotCounters {
    stats: CachePadded<Stats>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub captured: u64,
    pub capture_errors: u64,
    pub routed: u64,
    pub preview_offered: u64,
    pub preview_replaced: u64,
    pub preview_shown: u64,
    pub storage_admitted: u64,
    pub storage_dropped: u64,
    pub storage_written: u64,
    pub storage_skipped: u64,
    pub video_write_failures: u64,
    pub hardware_dropped: u64,
}

impl SlotCounters {
    fn cell(&self, counter: Counter) -> &AtomicU64 {
        let s = &self.stats;
        match counter {
            Counter::Captured => &s.captured,
            Counter::CaptureErrors => &s.capture_errors,
            Counter::Routed => &s.routed,
            Counter::PreviewOffered => &s.preview_offered,
            Counter::PreviewReplaced => &s.preview_replaced,
            Counter::PreviewShown => &s.preview_shown,
            Counter::StorageAdmitted => &s.storage_admitted,
            Counter::StorageDropped => &s.storage_dropped,
            Counter::StorageWritten => &s.storage_written,
            Counter::StorageSkipped => &s.storage_skipped,
            Counter::VideoWriteFailures => &s.video_write_failures,
            Counter::HardwareDropped => &s.hardware_dropped,
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.cell(counter).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            captured: self.get(Counter::Captured),
            capture_errors: self.get(Counter::CaptureErrors),
            routed: self.get(Counter::Routed),
            preview_offered: self.get(Counter::PreviewOffered),
            preview_replaced: self.get(Counter::PreviewReplaced),
            preview_shown: self.get(Counter::PreviewShown),
            storage_admitted: self.get(Counter::StorageAdmitted),
            storage_dropped: self.get(Counter::StorageDropped),
            storage_written: self.get(Counter::StorageWritten),
            storage_skipped: self.get(Counter::StorageSkipped),
            video_write_failures: self.get(Counter::VideoWriteFailures),
            hardware_dropped: self.get(Counter::HardwareDropped),
        }
    }
}

/// Everything needed to bring a slot up around an already started backend.
pub struct SlotParams {
    pub alias: CameraId,
    pub backend: Box<dyn CameraBackend>,
    pub negotiated: NegotiatedMode,
    pub pipeline: PipelineConfig,
    pub view: Arc<dyn FrameView>,
    pub events: mpsc::UnboundedSender<SlotEvent>,
    pub epoch: Instant,
    pub cancel: CancellationToken,
}

struct RecordingTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CameraSlot {
    alias: CameraId,
    negotiated: NegotiatedMode,
    control: Arc<SlotControl>,
    counters: Arc<SlotCounters>,
    /// Kept so a recording consumer can attach at any time
    storage_rx: flume::Receiver<FramePayload>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    recording: Option<RecordingTask>,
}

impl CameraSlot {
    /// Spawn the capture, router, preview and metrics tasks.
    pub fn spawn(params: SlotParams) -> Self {
        let SlotParams {
            alias,
            backend,
            negotiated,
            pipeline,
            view,
            events,
            epoch,
            cancel,
        } = params;

        let control = Arc::new(SlotControl::new(RouteSettings::from_config(&pipeline)));
        let counters = Arc::new(SlotCounters::default());

        let (capture_tx, capture_rx) = flume::unbounded::<CapturedFrame>();
        let (preview, preview_rx) = preview_queue();
        let (storage_tx, storage_rx) = flume::bounded(pipeline.storage_queue_depth.max(1));

        let capture = CaptureLoop {
            alias: alias.clone(),
            backend,
            tx: capture_tx,
            paused: control.subscribe_paused(),
            counters: counters.clone(),
            events,
            epoch,
            retry_delay: Duration::from_millis(pipeline.capture_retry_ms),
            failure_threshold: pipeline.capture_failure_threshold,
        };

        let router = FrameRouter::new(
            alias.clone(),
            control.clone(),
            negotiated.fps,
            preview,
            storage_tx,
            counters.clone(),
        );

        let tasks = vec![
            ("capture", tokio::spawn(capture.run(cancel.clone()))),
            ("router", tokio::spawn(router.run(capture_rx, cancel.clone()))),
            (
                "preview",
                tokio::spawn(preview::run_preview(
                    alias.clone(),
                    preview_rx,
                    view.clone(),
                    counters.clone(),
                    cancel.clone(),
                )),
            ),
            (
                "metrics",
                tokio::spawn(metrics::run_metrics(
                    alias.clone(),
                    counters.clone(),
                    view,
                    Duration::from_millis(pipeline.metrics_interval_ms.max(1)),
                    cancel.clone(),
                )),
            ),
        ];

        info!(
            "{}: slot running at {}x{} {:.1} fps ({:?})",
            alias, negotiated.mode.width, negotiated.mode.height, negotiated.fps, negotiated.format
        );

        Self {
            alias,
            negotiated,
            control,
            counters,
            storage_rx,
            cancel,
            tasks,
            recording: None,
        }
    }

    pub fn alias(&self) -> &CameraId {
        &self.alias
    }

    pub fn negotiated(&self) -> NegotiatedMode {
        self.negotiated
    }

    pub fn control(&self) -> &Arc<SlotControl> {
        &self.control
    }

    pub fn counters(&self) -> &Arc<SlotCounters> {
        &self.counters
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Start draining the storage queue into `consumer` and enable saving.
    pub fn attach_recording(&mut self, consumer: StorageConsumer) {
        // Frames left over from a previous session must not leak into this one
        let stale = self.storage_rx.drain().count();
        if stale > 0 {
            debug!("{}: discarded {} stale storage frames", self.alias, stale);
        }

        let stop = self.cancel.child_token();
        let handle = tokio::spawn(consumer.run(self.storage_rx.clone(), stop.clone()));
        self.recording = Some(RecordingTask { stop, handle });
        self.control.set_saving(true);
    }

    /// Disable saving, let the consumer drain and close its files.
    pub async fn detach_recording(&mut self, timeout: Duration) -> bool {
        self.control.set_saving(false);
        let Some(RecordingTask { stop, handle }) = self.recording.take() else {
            return true;
        };
        stop.cancel();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("{}: storage task ended abnormally: {}", self.alias, e);
                true
            }
            Err(_) => {
                warn!("{}: storage task did not finish within {:?}", self.alias, timeout);
                false
            }
        }
    }

    /// Cancel every task and wait for them. Driver stop/close happens in the
    /// capture task, so this can hang on a wedged camera; callers bound it.
    pub async fn shutdown(mut self) {
        self.control.set_saving(false);
        if let Some(RecordingTask { stop, handle }) = self.recording.take() {
            stop.cancel();
            if let Err(e) = handle.await {
                warn!("{}: storage task: {}", self.alias, e);
            }
        }

        self.cancel.cancel();
        for (name, handle) in self.tasks.drain(..) {
            match handle.await {
                Ok(()) => debug!("{}: {} task finished", self.alias, name),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("{}: {} task panicked: {}", self.alias, name, e),
            }
        }
        info!("{}: slot torn down", self.alias);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_from_fraction() {
        assert_eq!(preview_stride(1.0), 1);
        assert_eq!(preview_stride(0.5), 2);
        assert_eq!(preview_stride(1.0 / 3.0), 3);
        assert_eq!(preview_stride(0.25), 4);
        assert_eq!(preview_stride(0.1), 4);
        assert_eq!(preview_stride(0.0), 1);
    }

    #[test]
    fn control_settings_are_swapped_not_mutated() {
        let control = SlotControl::new(RouteSettings {
            preview_stride: 1,
            preview_fps: 0.0,
            save_fps: 0.0,
            saving: false,
        });
        let before = control.settings();
        control.set_saving(true);
        control.set_save_fps(10.0);
        let after = control.settings();
        assert!(!before.saving);
        assert!(after.saving);
        assert_eq!(after.save_fps, 10.0);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn pause_is_observable() {
        let control = SlotControl::new(RouteSettings {
            preview_stride: 1,
            preview_fps: 0.0,
            save_fps: 0.0,
            saving: false,
        });
        let rx = control.subscribe_paused();
        control.set_paused(true);
        assert!(*rx.borrow());
        assert!(control.is_paused());
    }

    #[test]
    fn counters_snapshot() {
        let counters = SlotCounters::default();
        counters.incr(Counter::Captured);
        counters.add(Counter::StorageDropped, 3);
        let snap = counters.snapshot();
        assert_eq!(snap.captured, 1);
        assert_eq!(snap.storage_dropped, 3);
        assert_eq!(snap.routed, 0);
    }
}
