//! Storage queue drain, conversion and stall escalation

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::decoder::{prepare_for_encoder, EncoderInput};
use crate::capture::frame::FramePayload;
use crate::registry::CameraId;
use crate::storage::{StorageSink, StorageWriteResult};

use super::slot::{Counter, SlotControl, SlotCounters};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageFailureReason {
    WriterStalled { consecutive: u32 },
    Fatal(String),
}

impl fmt::Display for StorageFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageFailureReason::WriterStalled { .. } => f.write_str("video writer stalled"),
            StorageFailureReason::Fatal(reason) => write!(f, "storage error: {reason}"),
        }
    }
}

/// Recording session number, assigned by the controller
pub type SessionId = u64;

#[derive(Debug, Clone)]
pub struct StorageFailure {
    pub session: SessionId,
    pub camera: CameraId,
    pub reason: StorageFailureReason,
}

/// Delivers a storage failure to the handler at most once.
///
/// One reporter is created per recording session and shared by all of its
/// consumers; failures carry the session so late ones can be told apart.
#[derive(Clone)]
pub struct FailureReporter {
    session: SessionId,
    reported: Arc<AtomicBool>,
    handler: Arc<dyn Fn(StorageFailure) + Send + Sync>,
}

impl FailureReporter {
    pub fn new(session: SessionId, handler: impl Fn(StorageFailure) + Send + Sync + 'static) -> Self {
        Self {
            session,
            reported: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(handler),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns true if this call reached the handler.
    pub fn report(&self, camera: CameraId, reason: StorageFailureReason) -> bool {
        if self.reported.swap(true, Ordering::AcqRel) {
            debug!("{}: failure already reported for session {}", camera, self.session);
            return false;
        }
        (self.handler)(StorageFailure {
            session: self.session,
            camera,
            reason,
        });
        true
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }
}

/// Counts consecutive frames that never reached the video file.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: u32,
    consecutive: u32,
}

impl StallDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Returns true on the frame that reaches the stall threshold.
    pub fn observe(&mut self, video_written: bool) -> bool {
        if video_written {
            self.consecutive = 0;
            return false;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive == self.threshold
    }
}

pub struct StorageConsumer {
    alias: CameraId,
    sink: Box<dyn StorageSink>,
    target: Option<(u32, u32)>,
    stall: StallDetector,
    reporter: FailureReporter,
    control: Arc<SlotControl>,
    counters: Arc<SlotCounters>,
    video_started: bool,
}

impl StorageConsumer {
    pub fn new(
        alias: CameraId,
        sink: Box<dyn StorageSink>,
        target: Option<(u32, u32)>,
        stall_threshold: u32,
        reporter: FailureReporter,
        control: Arc<SlotControl>,
        counters: Arc<SlotCounters>,
    ) -> Self {
        Self {
            alias,
            sink,
            target,
            stall: StallDetector::new(stall_threshold),
            reporter,
            control,
            counters,
            video_started: false,
        }
    }

    fn fail(&mut self, reason: StorageFailureReason) {
        self.control.set_saving(false);
        let message = reason.to_string();
        if self.reporter.report(self.alias.clone(), reason) {
            error!("{}: {}", self.alias, message);
        }
    }

    fn fps_hint(&self, payload: &FramePayload) -> f64 {
        let cap = self.control.settings().save_fps;
        match (payload.fps_estimate > 0.0, cap > 0.0) {
            (true, true) => payload.fps_estimate.min(cap),
            (true, false) => payload.fps_estimate,
            (false, true) => cap,
            (false, false) => 30.0,
        }
    }

    /// Convert and write one payload. Blocking.
    pub fn handle(&mut self, payload: &FramePayload) -> Option<StorageWriteResult> {
        let fps_hint = self.fps_hint(payload);

        if !self.video_started {
            if let Err(e) = self.sink.start_video_recording(fps_hint) {
                self.fail(StorageFailureReason::Fatal(e.to_string()));
                return None;
            }
            self.video_started = true;
        }

        let input = match prepare_for_encoder(payload, self.target) {
            Ok(input) => Some(input),
            Err(e) => {
                warn!("{}: frame {} not converted: {}", self.alias, payload.capture_index, e);
                None
            }
        };
        let (frame, encoded) = match &input {
            Some(EncoderInput::Rgb(img)) => (Some(img), None),
            Some(EncoderInput::Encoded(bytes)) => (None, Some(&bytes[..])),
            None => (None, None),
        };

        match self.sink.write_frame(frame, payload, fps_hint, encoded) {
            Ok(result) => {
                if result.video_written {
                    self.counters.incr(Counter::StorageWritten);
                } else {
                    self.counters.incr(Counter::VideoWriteFailures);
                }
                if self.stall.observe(result.video_written) {
                    let consecutive = self.stall.consecutive();
                    self.fail(StorageFailureReason::WriterStalled { consecutive });
                }
                Some(result)
            }
            Err(e) => {
                self.fail(StorageFailureReason::Fatal(e.to_string()));
                None
            }
        }
    }

    /// Keep only the newest of `first` and whatever queued up behind it.
    fn collapse_backlog(&self, rx: &flume::Receiver<FramePayload>, first: FramePayload) -> FramePayload {
        let mut latest = first;
        let mut skipped = 0;
        while let Ok(next) = rx.try_recv() {
            latest = next;
            skipped += 1;
        }
        if skipped > 0 {
            self.counters.add(Counter::StorageSkipped, skipped);
        }
        latest
    }

    /// Drain `rx` until `stop` fires and the queue is empty, then close the sink.
    #[instrument(skip_all, fields(camera = %self.alias))]
    pub async fn run(self, rx: flume::Receiver<FramePayload>, stop: CancellationToken) {
        let mut consumer = self;

        let started = tokio::task::spawn_blocking(move || {
            let result = consumer.sink.start();
            (consumer, result)
        })
        .await;
        consumer = match started {
            Ok((mut consumer, Err(e))) => {
                consumer.fail(StorageFailureReason::Fatal(e.to_string()));
                return;
            }
            Ok((consumer, Ok(()))) => consumer,
            Err(e) => {
                error!("storage start worker failed: {}", e);
                return;
            }
        };
        info!("storage consumer started");

        loop {
            let payload = tokio::select! {
                biased;
                payload = rx.recv_async() => match payload {
                    Ok(payload) => payload,
                    Err(_) => break,
                },
                _ = stop.cancelled() => break,
            };
            let payload = consumer.collapse_backlog(&rx, payload);

            consumer = match tokio::task::spawn_blocking(move || {
                consumer.handle(&payload);
                consumer
            })
            .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("storage worker failed: {}", e);
                    return;
                }
            };
        }

        let alias = consumer.alias.clone();
        match tokio::task::spawn_blocking(move || consumer.sink.stop()).await {
            Ok(Ok(())) => info!("storage consumer stopped"),
            Ok(Err(e)) => error!("{}: closing storage failed: {}", alias, e),
            Err(e) => error!("{}: storage stop worker failed: {}", alias, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use image::RgbImage;

    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::pipeline::slot::RouteSettings;
    use crate::storage::StorageError;

    /// Sink whose video writer never accepts a frame.
    struct StalledSink;

    impl StorageSink for StalledSink {
        fn start(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        fn start_video_recording(&mut self, _fps_hint: f64) -> Result<(), StorageError> {
            Ok(())
        }

        fn write_frame(
            &mut self,
            _frame: Option<&RgbImage>,
            _payload: &FramePayload,
            fps_hint: f64,
            _encoded: Option<&[u8]>,
        ) -> Result<StorageWriteResult, StorageError> {
            Ok(StorageWriteResult {
                still_path: None,
                video_written: false,
                fps: fps_hint,
            })
        }

        fn stop(&mut self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn payload(index: u64) -> FramePayload {
        FramePayload {
            data: Bytes::from(vec![0u8; 2 * 2 * 3]),
            width: 2,
            height: 2,
            format: PixelFormat::Rgb24,
            wall_time: Utc::now(),
            monotonic: Duration::from_millis(index),
            hardware_frame_number: index,
            dropped_since_last: 0,
            sensor_timestamp_ns: None,
            capture_index: index,
            fps_estimate: 30.0,
        }
    }

    fn control() -> Arc<SlotControl> {
        Arc::new(SlotControl::new(RouteSettings {
            preview_stride: 1,
            preview_fps: 0.0,
            save_fps: 10.0,
            saving: true,
        }))
    }

    #[test]
    fn stall_detector_resets_on_success() {
        let mut stall = StallDetector::new(3);
        assert!(!stall.observe(false));
        assert!(!stall.observe(false));
        assert!(!stall.observe(true));
        assert!(!stall.observe(false));
        assert!(!stall.observe(false));
        assert!(stall.observe(false));
        // Only the crossing fires
        assert!(!stall.observe(false));
        assert_eq!(stall.consecutive(), 4);
    }

    #[test]
    fn stalled_writer_reports_once_per_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let reporter = FailureReporter::new(7, move |failure| {
            assert_eq!(failure.session, 7);
            assert_eq!(
                failure.reason,
                StorageFailureReason::WriterStalled { consecutive: 60 }
            );
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let control = control();
        let mut consumer = StorageConsumer::new(
            Arc::from("cam0"),
            Box::new(StalledSink),
            None,
            60,
            reporter.clone(),
            control.clone(),
            Arc::new(SlotCounters::default()),
        );

        for i in 1..=59 {
            consumer.handle(&payload(i));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        consumer.handle(&payload(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!control.is_saving());

        for i in 61..=150 {
            consumer.handle(&payload(i));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(reporter.is_reported());
        assert_eq!(consumer.stall.consecutive(), 150);
    }

    #[test]
    fn reporter_is_shared_by_a_sessions_consumers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let reporter = FailureReporter::new(1, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let other = reporter.clone();

        assert!(reporter.report(Arc::from("cam0"), StorageFailureReason::Fatal("disk full".into())));
        assert!(!other.report(Arc::from("cam1"), StorageFailureReason::WriterStalled { consecutive: 60 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A new session gets a reporter of its own
        let next = FailureReporter::new(2, |_| {});
        assert!(!next.is_reported());
        assert!(next.report(Arc::from("cam0"), StorageFailureReason::Fatal("disk full".into())));
    }

    #[test]
    fn fps_hint_respects_save_cap() {
        let consumer = StorageConsumer::new(
            Arc::from("cam0"),
            Box::new(StalledSink),
            None,
            60,
            FailureReporter::new(1, |_| {}),
            control(),
            Arc::new(SlotCounters::default()),
        );
        assert_eq!(consumer.fps_hint(&payload(1)), 10.0);
    }

    #[test]
    fn backlog_collapses_to_newest() {
        let consumer = StorageConsumer::new(
            Arc::from("cam0"),
            Box::new(StalledSink),
            None,
            60,
            FailureReporter::new(1, |_| {}),
            control(),
            Arc::new(SlotCounters::default()),
        );
        let (tx, rx) = flume::bounded(8);
        for i in 2..=5 {
            tx.send(payload(i)).unwrap();
        }
        let latest = consumer.collapse_backlog(&rx, payload(1));
        assert_eq!(latest.capture_index, 5);
        assert_eq!(consumer.counters.get(Counter::StorageSkipped), 4);
    }
}
