use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::backend::{CameraBackend, CameraError};
use crate::capture::frame::{CapturedFrame, RawFrame};
use crate::registry::CameraId;

use super::gate::FrameGate;
use super::slot::{Counter, SlotCounters};
use super::SlotEvent;

const FAILURE_LOG_INTERVAL_SECS: f64 = 5.0;

/// Pulls frames from the driver and appends them to the capture queue.
///
/// The only task that touches the backend after it is started.
pub struct CaptureLoop {
    pub(crate) alias: CameraId,
    pub(crate) backend: Box<dyn CameraBackend>,
    pub(crate) tx: flume::Sender<CapturedFrame>,
    pub(crate) paused: watch::Receiver<bool>,
    pub(crate) counters: Arc<SlotCounters>,
    pub(crate) events: mpsc::UnboundedSender<SlotEvent>,
    pub(crate) epoch: Instant,
    pub(crate) retry_delay: Duration,
    pub(crate) failure_threshold: u32,
}

enum Step {
    Frame(Box<dyn CameraBackend>, RawFrame),
    Failed(Box<dyn CameraBackend>, CameraError),
    Lost(String),
}

impl CaptureLoop {
    #[instrument(skip_all, fields(camera = %self.alias))]
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut log_gate = FrameGate::new(FAILURE_LOG_INTERVAL_SECS);
        let mut consecutive_failures: u32 = 0;
        let mut lost_reported = false;
        let mut backend = Some(self.backend);

        info!("capture loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if *self.paused.borrow_and_update() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = self.paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let Some(mut cam) = backend.take() else {
                break;
            };
            // Driver reads block; they are not cancellable once issued
            let step = match tokio::task::spawn_blocking(move || match cam.read_frame() {
                Ok(frame) => Step::Frame(cam, frame),
                Err(e) => Step::Failed(cam, e),
            })
            .await
            {
                Ok(step) => step,
                Err(e) => Step::Lost(e.to_string()),
            };

            match step {
                Step::Frame(cam, raw) => {
                    backend = Some(cam);
                    if lost_reported {
                        info!("capture recovered after {} failed reads", consecutive_failures);
                        let _ = self.events.send(SlotEvent::CaptureRecovered {
                            camera: self.alias.clone(),
                        });
                        lost_reported = false;
                    }
                    consecutive_failures = 0;
                    self.counters.incr(Counter::Captured);

                    let frame = CapturedFrame {
                        raw,
                        wall_time: Utc::now(),
                        monotonic: self.epoch.elapsed(),
                    };
                    if self.tx.send_async(frame).await.is_err() {
                        debug!("router gone, stopping capture");
                        break;
                    }
                }
                Step::Failed(cam, e) => {
                    backend = Some(cam);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.counters.incr(Counter::CaptureErrors);

                    if log_gate.should_emit(self.epoch.elapsed()) {
                        warn!("frame read failed ({} in a row): {}", consecutive_failures, e);
                    }

                    if consecutive_failures >= self.failure_threshold && !lost_reported {
                        error!("{} consecutive read failures, camera considered lost", consecutive_failures);
                        let _ = self.events.send(SlotEvent::CaptureLost {
                            camera: self.alias.clone(),
                            reason: e.to_string(),
                        });
                        lost_reported = true;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Step::Lost(reason) => {
                    error!("capture worker panicked: {}", reason);
                    let _ = self.events.send(SlotEvent::CaptureLost {
                        camera: self.alias.clone(),
                        reason,
                    });
                    break;
                }
            }
        }

        if let Some(mut cam) = backend {
            let closed = tokio::task::spawn_blocking(move || cam.close()).await;
            match closed {
                Ok(Ok(())) => debug!("backend closed"),
                Ok(Err(e)) => warn!("close failed: {}", e),
                Err(e) => warn!("close worker failed: {}", e),
            }
        }

        info!("capture loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::capture::backend::{CaptureRequest, NegotiatedMode, SensorMode};
    use crate::capture::frame::PixelFormat;

    /// Backend that plays a script of good (`true`) and failed reads, then
    /// keeps producing frames.
    struct Scripted {
        script: VecDeque<bool>,
        reads: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl CameraBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supported_modes(&self) -> Vec<SensorMode> {
            Vec::new()
        }

        fn configure(&mut self, _request: &CaptureRequest) -> Result<NegotiatedMode, CameraError> {
            Err(CameraError::NotStarted)
        }

        fn start(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), CameraError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), CameraError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if !self.script.pop_front().unwrap_or(true) {
                return Err(CameraError::Read("timeout".into()));
            }
            std::thread::sleep(Duration::from_millis(1));
            Ok(RawFrame {
                data: Bytes::from_static(&[0, 0, 0]),
                width: 1,
                height: 1,
                format: PixelFormat::Rgb24,
                sensor_timestamp_ns: None,
                frame_duration_ns: None,
            })
        }
    }

    struct Harness {
        frames: flume::Receiver<CapturedFrame>,
        events: mpsc::UnboundedReceiver<SlotEvent>,
        pause: watch::Sender<bool>,
        counters: Arc<SlotCounters>,
        reads: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(script: &[bool], paused: bool) -> Harness {
        let reads = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, frames) = flume::unbounded();
        let (pause, paused) = watch::channel(paused);
        let (events_tx, events) = mpsc::unbounded_channel();
        let counters = Arc::new(SlotCounters::default());
        let cancel = CancellationToken::new();

        let capture = CaptureLoop {
            alias: Arc::from("cam0"),
            backend: Box::new(Scripted {
                script: script.iter().copied().collect(),
                reads: reads.clone(),
                closed: closed.clone(),
            }),
            tx,
            paused,
            counters: counters.clone(),
            events: events_tx,
            epoch: Instant::now(),
            retry_delay: Duration::from_millis(1),
            failure_threshold: 3,
        };
        let task = tokio::spawn(capture.run(cancel.clone()));

        Harness {
            frames,
            events,
            pause,
            counters,
            reads,
            closed,
            cancel,
            task,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SlotEvent>) -> SlotEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within 5s")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn lost_once_at_threshold_and_rearmed_by_recovery() {
        let (t, f) = (true, false);
        let mut h = spawn(&[f, f, t, f, f, f, f, t, f, f, f, t], false);

        // Two failures stay below the threshold; four in a row report once
        assert!(matches!(next_event(&mut h.events).await, SlotEvent::CaptureLost { .. }));
        assert!(matches!(next_event(&mut h.events).await, SlotEvent::CaptureRecovered { .. }));
        assert!(matches!(next_event(&mut h.events).await, SlotEvent::CaptureLost { .. }));
        assert!(matches!(next_event(&mut h.events).await, SlotEvent::CaptureRecovered { .. }));

        // Let the loop run well past the script
        while h.reads.load(Ordering::SeqCst) < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.cancel.cancel();
        h.task.await.unwrap();

        assert!(h.events.try_recv().is_err());
        assert_eq!(h.counters.snapshot().capture_errors, 9);
        assert!(h.counters.snapshot().captured >= 3);
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn paused_capture_reads_nothing() {
        let h = spawn(&[], true);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.reads.load(Ordering::SeqCst), 0);
        assert!(h.frames.is_empty());

        h.pause.send(false).unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), h.frames.recv_async())
            .await
            .expect("no frame after resume")
            .unwrap();
        assert_eq!(frame.raw.width, 1);

        h.pause.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reads = h.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.reads.load(Ordering::SeqCst), reads);

        // Cancellation also ends a paused loop
        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn backend_closed_when_router_goes_away() {
        let h = spawn(&[false, true], false);
        drop(h.frames);

        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("capture loop kept running")
            .unwrap();
        assert!(h.closed.load(Ordering::SeqCst));
        assert_eq!(h.counters.snapshot().capture_errors, 1);
        assert_eq!(h.reads.load(Ordering::SeqCst), 2);
    }
}
