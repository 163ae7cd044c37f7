//! Session controller: camera bring-up, recording sessions, failure recovery

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::backend::{select_sensor_mode, CameraError, CaptureRequest, SensorMode};
use crate::capture::BackendFactory;
use crate::display::FrameView;
use crate::pipeline::slot::SlotParams;
use crate::pipeline::{
    CameraSlot, CounterSnapshot, FailureReporter, SessionId, SlotControl, SlotEvent,
    StorageConsumer, StorageFailure,
};
use crate::registry::{CameraEntry, CameraId, CameraRegistry, SlotState};
use crate::storage::{MjpegStorageFactory, SinkFactory};
use crate::utils::{camera_output_dir, session_stamp};
use crate::{CaptureConfig, Config, ReinitScope};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("{alias}: {source}")]
    Camera {
        alias: String,
        #[source]
        source: CameraError,
    },
    #[error("no camera could be started")]
    NoCameras,
    #[error("already recording to {0}")]
    AlreadyRecording(PathBuf),
    #[error("not recording")]
    NotRecording,
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("cannot create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimedOut(Duration),
    #[error("worker task failed: {0}")]
    Task(String),
    #[error("controller is gone")]
    Closed,
    #[error("{0}")]
    Rejected(String),
}

/// Everything a client can see about the rig at once.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub recording: Option<PathBuf>,
    pub paused: bool,
    pub cameras: Vec<CameraEntry>,
}

type Reply<T> = oneshot::Sender<Result<T, String>>;

/// Requests served by [`Controller::run`].
#[derive(Debug)]
pub enum Command {
    StartRecording { dir: Option<PathBuf>, reply: Reply<PathBuf> },
    StopRecording { reply: Reply<PathBuf> },
    SetPaused { paused: bool, reply: Reply<()> },
    SetSaveFps { fps: f64, reply: Reply<()> },
    SetPreviewFraction { fraction: f64, reply: Reply<()> },
    Status { reply: oneshot::Sender<ControllerStatus> },
    Shutdown { reply: Reply<()> },
}

/// Cloneable sender side of the command channel.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| ControllerError::Closed)?;
        rx.await
            .map_err(|_| ControllerError::Closed)?
            .map_err(ControllerError::Rejected)
    }

    pub async fn start_recording(&self, dir: Option<PathBuf>) -> Result<PathBuf, ControllerError> {
        self.request(|reply| Command::StartRecording { dir, reply }).await
    }

    pub async fn stop_recording(&self) -> Result<PathBuf, ControllerError> {
        self.request(|reply| Command::StopRecording { reply }).await
    }

    pub async fn set_paused(&self, paused: bool) -> Result<(), ControllerError> {
        self.request(|reply| Command::SetPaused { paused, reply }).await
    }

    pub async fn set_save_fps(&self, fps: f64) -> Result<(), ControllerError> {
        self.request(|reply| Command::SetSaveFps { fps, reply }).await
    }

    pub async fn set_preview_fraction(&self, fraction: f64) -> Result<(), ControllerError> {
        self.request(|reply| Command::SetPreviewFraction { fraction, reply }).await
    }

    pub async fn status(&self) -> Result<ControllerStatus, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// The recording in progress.
struct Session {
    id: SessionId,
    dir: PathBuf,
}

enum Next {
    Event(SlotEvent),
    Command(Option<Command>),
}

pub struct Controller {
    config: Config,
    factory: Arc<dyn BackendFactory>,
    sinks: Arc<dyn SinkFactory>,
    view: Arc<dyn FrameView>,
    registry: CameraRegistry,
    slots: BTreeMap<CameraId, CameraSlot>,
    events_tx: mpsc::UnboundedSender<SlotEvent>,
    events_rx: mpsc::UnboundedReceiver<SlotEvent>,
    session: Option<Session>,
    last_session: SessionId,
    paused: bool,
    cancel: CancellationToken,
    epoch: Instant,
}

impl Controller {
    pub fn new(config: Config, factory: Arc<dyn BackendFactory>, view: Arc<dyn FrameView>) -> Self {
        let sinks = Arc::new(MjpegStorageFactory::new(config.storage.clone()));
        Self::with_sink_factory(config, factory, sinks, view)
    }

    pub fn with_sink_factory(
        config: Config,
        factory: Arc<dyn BackendFactory>,
        sinks: Arc<dyn SinkFactory>,
        view: Arc<dyn FrameView>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            factory,
            sinks,
            view,
            registry: CameraRegistry::new(),
            slots: BTreeMap::new(),
            events_tx,
            events_rx,
            session: None,
            last_session: 0,
            paused: false,
            cancel: CancellationToken::new(),
            epoch: Instant::now(),
        }
    }

    pub fn registry(&self) -> CameraRegistry {
        self.registry.clone()
    }

    pub fn session(&self) -> Option<&PathBuf> {
        self.session.as_ref().map(|session| &session.dir)
    }

    /// Id of the recording in progress. Failures carry it so that late
    /// reports from a closed session are told apart.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn control(&self, alias: &str) -> Option<Arc<SlotControl>> {
        self.slots.get(alias).map(|slot| slot.control().clone())
    }

    pub fn counters(&self, alias: &str) -> Option<CounterSnapshot> {
        self.slots.get(alias).map(|slot| slot.counters().snapshot())
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            recording: self.session().cloned(),
            paused: self.paused,
            cameras: self.registry.entries(),
        }
    }

    fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.config.controller.shutdown_timeout_ms)
    }

    /// Open every configured camera. Cameras that fail stay in the registry
    /// as `Error`; only a rig with no working camera is an error.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        let cameras = self.config.cameras.clone();
        for camera in &cameras {
            if let Err(e) = self.open_slot(camera).await {
                error!("{}", e);
            }
        }
        if self.slots.is_empty() {
            return Err(ControllerError::NoCameras);
        }
        info!("{} of {} cameras streaming", self.slots.len(), cameras.len());
        self.view.set_status("Streaming");
        Ok(())
    }

    async fn open_slot(&mut self, camera: &CaptureConfig) -> Result<(), ControllerError> {
        let alias: CameraId = Arc::from(camera.alias.as_str());
        if self.registry.state(&alias) != Some(SlotState::Reinitializing) {
            self.registry.set_state(&alias, SlotState::Uninitialized);
        }

        let factory = self.factory.clone();
        let cfg = camera.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let mut backend = factory.open(&cfg)?;
            let requested = SensorMode::new(cfg.width, cfg.height);
            let mode = select_sensor_mode(requested, &backend.supported_modes());
            let negotiated = backend.configure(&CaptureRequest {
                mode,
                fps: cfg.fps,
                format: cfg.format,
            })?;
            backend.start()?;
            Ok::<_, CameraError>((backend, negotiated))
        })
        .await
        .map_err(|e| ControllerError::Task(e.to_string()))?;

        let (backend, negotiated) = match opened {
            Ok(opened) => opened,
            Err(source) => {
                self.registry.set_error(&alias, &source.to_string());
                return Err(ControllerError::Camera {
                    alias: camera.alias.clone(),
                    source,
                });
            }
        };

        let driver = backend.name().to_string();
        let slot = CameraSlot::spawn(SlotParams {
            alias: alias.clone(),
            backend,
            negotiated,
            pipeline: self.config.pipeline.clone(),
            view: self.view.clone(),
            events: self.events_tx.clone(),
            epoch: self.epoch,
            cancel: self.cancel.child_token(),
        });
        slot.control().set_paused(self.paused);

        self.registry.update(&alias, |entry| {
            entry.driver = driver.clone();
            entry.mode = Some(negotiated);
            entry.state = SlotState::Streaming;
            entry.last_error = None;
        });
        self.slots.insert(alias, slot);
        Ok(())
    }

    /// Begin a recording session in `dir`, or in a timestamped directory
    /// under the session root.
    #[instrument(skip(self))]
    pub async fn start_recording(&mut self, dir: Option<PathBuf>) -> Result<PathBuf, ControllerError> {
        if let Some(current) = &self.session {
            return Err(ControllerError::AlreadyRecording(current.dir.clone()));
        }
        if self.slots.is_empty() {
            return Err(ControllerError::NoCameras);
        }

        let stamp = session_stamp(Utc::now());
        let dir = dir.unwrap_or_else(|| self.config.module.session_root.join(&stamp));
        let target = dir.clone();
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(target))
            .await
            .map_err(|e| ControllerError::Task(e.to_string()))?
            .map_err(|source| ControllerError::Io {
                path: dir.clone(),
                source,
            })?;

        self.last_session += 1;
        let id = self.last_session;
        let failures = self.events_tx.clone();
        let reporter = FailureReporter::new(id, move |failure: StorageFailure| {
            if failures.send(SlotEvent::StorageFailed(failure)).is_err() {
                warn!("storage failure raised after the controller stopped");
            }
        });
        for (alias, slot) in self.slots.iter_mut() {
            let camera_dir = camera_output_dir(&dir, &self.config.module.name, alias);
            let sink = self.sinks.create(&camera_dir, alias, &stamp);
            let consumer = StorageConsumer::new(
                alias.clone(),
                sink,
                self.config.storage.target_size(),
                self.config.storage.stall_threshold,
                reporter.clone(),
                slot.control().clone(),
                slot.counters().clone(),
            );
            slot.attach_recording(consumer);
            self.registry.set_state(alias, SlotState::Recording);
        }

        info!("Recording session {}", dir.display());
        self.view.set_status(&format!("Recording to {}", dir.display()));
        self.session = Some(Session { id, dir: dir.clone() });
        Ok(dir)
    }

    #[instrument(skip(self))]
    pub async fn stop_recording(&mut self) -> Result<PathBuf, ControllerError> {
        let dir = self.end_recording().await.ok_or(ControllerError::NotRecording)?;
        self.view.set_status("Recording stopped");
        Ok(dir)
    }

    /// Detach every consumer so the files get closed. Returns the session dir.
    async fn end_recording(&mut self) -> Option<PathBuf> {
        let Session { dir, .. } = self.session.take()?;
        let timeout = self.shutdown_timeout();
        for (alias, slot) in self.slots.iter_mut() {
            if !slot.detach_recording(timeout).await {
                warn!("{}: recording files may be incomplete", alias);
            }
            if self.registry.state(alias) == Some(SlotState::Recording) {
                self.registry.set_state(alias, SlotState::Streaming);
            }
        }
        info!("Recording session {} closed", dir.display());
        Some(dir)
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        for slot in self.slots.values() {
            slot.control().set_paused(paused);
        }
        self.view.set_status(if paused { "Capture paused" } else { "Capture resumed" });
    }

    /// Recording rate cap, 0 for every frame.
    pub fn set_save_fps(&mut self, fps: f64) -> Result<(), ControllerError> {
        if !fps.is_finite() || fps < 0.0 {
            return Err(ControllerError::InvalidSetting(format!("save fps {fps}")));
        }
        self.config.pipeline.save_fps = fps;
        for slot in self.slots.values() {
            slot.control().set_save_fps(fps);
        }
        Ok(())
    }

    /// Share of captured frames offered to preview, in `(0, 1]`.
    pub fn set_preview_fraction(&mut self, fraction: f64) -> Result<(), ControllerError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ControllerError::InvalidSetting(format!("preview fraction {fraction}")));
        }
        self.config.pipeline.preview_fraction = fraction;
        for slot in self.slots.values() {
            slot.control().set_preview_fraction(fraction);
        }
        Ok(())
    }

    /// React to an escalation from a slot task.
    pub async fn handle_event(&mut self, event: SlotEvent) {
        match event {
            SlotEvent::StorageFailed(failure) => self.handle_storage_failure(failure).await,
            SlotEvent::CaptureLost { camera, reason } => {
                self.registry.set_error(&camera, &reason);
                self.view.set_status(&format!("{camera}: capture lost ({reason})"));
            }
            SlotEvent::CaptureRecovered { camera } => {
                let state = match self.slots.get(&camera) {
                    Some(slot) if slot.is_recording() => SlotState::Recording,
                    Some(_) => SlotState::Streaming,
                    None => return,
                };
                self.registry.set_state(&camera, state);
                self.view.set_status(&format!("{camera}: capture recovered"));
            }
        }
    }

    async fn handle_storage_failure(&mut self, failure: StorageFailure) {
        if self.session_id() != Some(failure.session) {
            debug!(
                "{}: ignoring failure from closed session {}: {}",
                failure.camera, failure.session, failure.reason
            );
            return;
        }
        error!("{}: storage failed: {}", failure.camera, failure.reason);
        for slot in self.slots.values() {
            slot.control().set_saving(false);
        }
        self.end_recording().await;
        self.view.set_status(&format!("Recording stopped: {}", failure.reason));

        let targets: Vec<CameraId> = match self.config.controller.reinit_scope {
            ReinitScope::Failed => vec![failure.camera.clone()],
            ReinitScope::All => self.slots.keys().cloned().collect(),
        };
        for alias in targets {
            self.reinit_slot(&alias).await;
        }
    }

    /// Tear down and reopen one camera.
    #[instrument(skip(self))]
    pub async fn reinit_slot(&mut self, alias: &CameraId) {
        let Some(camera) = self.config.cameras.iter().find(|c| *c.alias == **alias).cloned() else {
            warn!("{}: not a configured camera", alias);
            return;
        };
        self.registry.set_state(alias, SlotState::Reinitializing);

        if let Some(slot) = self.slots.remove(alias) {
            let timeout = self.shutdown_timeout();
            if tokio::time::timeout(timeout, slot.shutdown()).await.is_err() {
                warn!("{}: old slot did not stop within {:?}", alias, timeout);
            }
        }

        match self.open_slot(&camera).await {
            Ok(()) => info!("{}: reinitialized", alias),
            Err(e) => {
                error!("{}", e);
                self.view.set_status(&format!("{alias}: reinit failed"));
            }
        }
    }

    /// Stop recording, cancel every slot and wait for them within the
    /// configured timeout.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) -> Result<(), ControllerError> {
        self.end_recording().await;
        self.cancel.cancel();

        let timeout = self.shutdown_timeout();
        let mut set = JoinSet::new();
        for (alias, slot) in std::mem::take(&mut self.slots) {
            self.registry.set_state(&alias, SlotState::Uninitialized);
            set.spawn(slot.shutdown());
        }

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!("slot shutdown task failed: {}", e);
                }
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("All cameras stopped");
                Ok(())
            }
            Err(_) => {
                set.abort_all();
                Err(ControllerError::ShutdownTimedOut(timeout))
            }
        }
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::StartRecording { dir, reply } => {
                let result = self.start_recording(dir).await;
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
            Command::StopRecording { reply } => {
                let result = self.stop_recording().await;
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
            Command::SetPaused { paused, reply } => {
                self.set_paused(paused);
                let _ = reply.send(Ok(()));
            }
            Command::SetSaveFps { fps, reply } => {
                let _ = reply.send(self.set_save_fps(fps).map_err(|e| e.to_string()));
            }
            Command::SetPreviewFraction { fraction, reply } => {
                let _ = reply.send(self.set_preview_fraction(fraction).map_err(|e| e.to_string()));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                let result = self.shutdown().await;
                let _ = reply.send(result.map_err(|e| e.to_string()));
            }
        }
    }

    /// Serve commands and slot events until a shutdown command arrives or
    /// every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), ControllerError> {
        loop {
            let next = tokio::select! {
                Some(event) = self.events_rx.recv() => Next::Event(event),
                command = commands.recv() => Next::Command(command),
            };

            match next {
                Next::Event(event) => self.handle_event(event).await,
                Next::Command(Some(Command::Shutdown { reply })) => {
                    let result = self.shutdown().await;
                    let _ = reply.send(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
                    return result;
                }
                Next::Command(Some(command)) => self.dispatch(command).await,
                Next::Command(None) => {
                    debug!("all controller handles dropped");
                    return self.shutdown().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::capture::{CameraBackend, DefaultBackendFactory, SyntheticOptions};
    use crate::capture::frame::FramePayload;
    use crate::pipeline::StorageFailureReason;
    use crate::{CameraSource, FpsSnapshot};

    #[derive(Default)]
    struct StatusLog(Mutex<Vec<String>>);

    impl FrameView for StatusLog {
        fn show_frame(&self, _camera: &str, _frame: &FramePayload) {}
        fn show_metrics(&self, _camera: &str, _metrics: &FpsSnapshot) {}
        fn set_status(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    struct Refuses;

    impl BackendFactory for Refuses {
        fn open(&self, _camera: &CaptureConfig) -> Result<Box<dyn CameraBackend>, CameraError> {
            Err(CameraError::NoDevice)
        }
    }

    fn config() -> Config {
        let mut cfg = Config::default();
        let mut cam = CaptureConfig::synthetic("cam0", 64, 48, 30.0);
        cam.source = CameraSource::Synthetic(SyntheticOptions {
            realtime: true,
            ..SyntheticOptions::default()
        });
        cfg.cameras.push(cam);
        cfg.controller.shutdown_timeout_ms = 2000;
        cfg
    }

    #[tokio::test]
    async fn start_without_any_camera_fails() {
        let view = Arc::new(StatusLog::default());
        let mut controller = Controller::new(config(), Arc::new(Refuses), view);
        assert!(matches!(controller.start().await, Err(ControllerError::NoCameras)));
        assert_eq!(controller.registry().state("cam0"), Some(SlotState::Error));
    }

    #[tokio::test]
    async fn runtime_settings_are_validated() {
        let view = Arc::new(StatusLog::default());
        let mut controller = Controller::new(config(), Arc::new(DefaultBackendFactory), view);
        controller.start().await.unwrap();

        assert!(controller.set_save_fps(-1.0).is_err());
        assert!(controller.set_preview_fraction(0.0).is_err());
        controller.set_save_fps(5.0).unwrap();
        controller.set_preview_fraction(0.5).unwrap();
        let control = controller.control("cam0").unwrap();
        assert_eq!(control.settings().save_fps, 5.0);
        assert_eq!(control.settings().preview_stride, 2);

        controller.set_paused(true);
        assert!(control.is_paused());
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn recording_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let view = Arc::new(StatusLog::default());
        let mut controller = Controller::new(config(), Arc::new(DefaultBackendFactory), view.clone());
        controller.start().await.unwrap();

        let session = controller.start_recording(Some(dir.path().join("s1"))).await.unwrap();
        assert_eq!(controller.registry().state("cam0"), Some(SlotState::Recording));
        assert!(matches!(
            controller.start_recording(None).await,
            Err(ControllerError::AlreadyRecording(p)) if p == session
        ));

        controller.stop_recording().await.unwrap();
        assert_eq!(controller.registry().state("cam0"), Some(SlotState::Streaming));
        assert!(matches!(controller.stop_recording().await, Err(ControllerError::NotRecording)));
        assert!(session.is_dir());
        controller.shutdown().await.unwrap();

        let statuses = view.0.lock().unwrap();
        assert!(statuses.iter().any(|s| s == "Recording stopped"));
    }

    #[tokio::test]
    async fn capture_loss_marks_only_that_camera() {
        let view = Arc::new(StatusLog::default());
        let mut cfg = config();
        cfg.cameras.push(CaptureConfig::synthetic("cam1", 64, 48, 30.0));
        let mut controller = Controller::new(cfg, Arc::new(DefaultBackendFactory), view.clone());
        controller.start().await.unwrap();

        controller
            .handle_event(SlotEvent::CaptureLost {
                camera: Arc::from("cam1"),
                reason: "unplugged".into(),
            })
            .await;
        let registry = controller.registry();
        assert_eq!(registry.state("cam1"), Some(SlotState::Error));
        assert_eq!(registry.state("cam0"), Some(SlotState::Streaming));

        controller
            .handle_event(SlotEvent::CaptureRecovered { camera: Arc::from("cam1") })
            .await;
        assert_eq!(registry.state("cam1"), Some(SlotState::Streaming));
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn recording_creates_nested_session_dirs() {
        let root = tempfile::tempdir().unwrap();
        let view = Arc::new(StatusLog::default());
        let mut controller = Controller::new(config(), Arc::new(DefaultBackendFactory), view);
        controller.start().await.unwrap();

        let nested = root.path().join("day1").join("run1");
        let session = controller.start_recording(Some(nested.clone())).await.unwrap();
        assert_eq!(session, nested);
        assert!(nested.is_dir());
        controller.stop_recording().await.unwrap();
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn late_failure_from_closed_session_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let view = Arc::new(StatusLog::default());
        let mut controller = Controller::new(config(), Arc::new(DefaultBackendFactory), view.clone());
        controller.start().await.unwrap();

        controller.start_recording(Some(root.path().join("s1"))).await.unwrap();
        let first = controller.session_id().unwrap();
        controller.stop_recording().await.unwrap();
        let second_dir = controller.start_recording(Some(root.path().join("s2"))).await.unwrap();
        let second = controller.session_id().unwrap();
        assert_ne!(first, second);

        controller
            .handle_event(SlotEvent::StorageFailed(StorageFailure {
                session: first,
                camera: Arc::from("cam0"),
                reason: StorageFailureReason::WriterStalled { consecutive: 60 },
            }))
            .await;
        assert_eq!(controller.session(), Some(&second_dir));
        assert_eq!(controller.registry().state("cam0"), Some(SlotState::Recording));
        assert!(controller.control("cam0").unwrap().settings().saving);

        // The current session's failure still stops it
        controller
            .handle_event(SlotEvent::StorageFailed(StorageFailure {
                session: second,
                camera: Arc::from("cam0"),
                reason: StorageFailureReason::WriterStalled { consecutive: 60 },
            }))
            .await;
        assert!(controller.session().is_none());
        let stopped = view.0.lock().unwrap().iter().filter(|s| s.starts_with("Recording stopped:")).count();
        assert_eq!(stopped, 1);
        controller.shutdown().await.unwrap();
    }
}
