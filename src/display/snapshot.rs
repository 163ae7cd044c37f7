//! Preview surface for headless rigs: the latest frame of each camera on disk

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use tracing::{debug, warn};

use super::{FrameView, LogView};
use crate::capture::decoder::decode_frame;
use crate::capture::frame::FramePayload;
use crate::pipeline::FrameGate;
use crate::utils::sanitize_alias;
use crate::FpsSnapshot;

/// Snapshots waiting for the writer thread.
const WRITE_QUEUE_DEPTH: usize = 4;

struct Snapshot {
    camera: String,
    path: PathBuf,
    frame: FramePayload,
}

/// Writes a JPEG per camera at most once per interval. Decoding and file
/// I/O run on a writer thread; `show_frame` only queues.
pub struct SnapshotView {
    dir: PathBuf,
    interval_seconds: f64,
    gates: Mutex<HashMap<String, FrameGate>>,
    writes: flume::Sender<Snapshot>,
    log: LogView,
}

impl SnapshotView {
    /// The writer thread exits once the view is dropped.
    pub fn new(dir: impl Into<PathBuf>, interval_seconds: f64) -> io::Result<Self> {
        let dir = dir.into();
        let (writes, rx) = flume::bounded::<Snapshot>(WRITE_QUEUE_DEPTH);
        let out = dir.clone();
        thread::Builder::new()
            .name("snapshot-writer".into())
            .spawn(move || {
                for snapshot in rx.iter() {
                    match write(&out, &snapshot.path, &snapshot.frame) {
                        Ok(()) => debug!(
                            "{}: preview written to {}",
                            snapshot.camera,
                            snapshot.path.display()
                        ),
                        Err(e) => warn!("{}: preview snapshot failed: {}", snapshot.camera, e),
                    }
                }
            })?;

        Ok(Self {
            dir,
            interval_seconds,
            gates: Mutex::new(HashMap::new()),
            writes,
            log: LogView,
        })
    }

    pub fn path_for(&self, camera: &str) -> PathBuf {
        self.dir.join(format!("{}_preview.jpg", sanitize_alias(camera)))
    }

    fn due(&self, camera: &str, frame: &FramePayload) -> bool {
        let Ok(mut gates) = self.gates.lock() else {
            return false;
        };
        gates
            .entry(camera.to_string())
            .or_insert_with(|| FrameGate::new(self.interval_seconds))
            .should_emit(frame.monotonic)
    }
}

fn write(dir: &Path, path: &Path, frame: &FramePayload) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    let img = decode_frame(&frame.data, frame.width, frame.height, frame.format)
        .map_err(|e| e.to_string())?;
    img.save(path).map_err(|e| e.to_string())
}

impl FrameView for SnapshotView {
    fn show_frame(&self, camera: &str, frame: &FramePayload) {
        if !self.due(camera, frame) {
            return;
        }
        let snapshot = Snapshot {
            camera: camera.to_string(),
            path: self.path_for(camera),
            frame: frame.clone(),
        };
        if let Err(flume::TrySendError::Full(_)) = self.writes.try_send(snapshot) {
            debug!("{}: snapshot writer busy, frame skipped", camera);
        }
    }

    fn show_metrics(&self, camera: &str, metrics: &FpsSnapshot) {
        self.log.show_metrics(camera, metrics);
    }

    fn set_status(&self, message: &str) {
        self.log.set_status(message);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::capture::frame::PixelFormat;

    fn frame(ms: u64) -> FramePayload {
        FramePayload {
            data: Bytes::from(vec![200u8; 4 * 2 * 3]),
            width: 4,
            height: 2,
            format: PixelFormat::Rgb24,
            wall_time: Utc::now(),
            monotonic: Duration::from_millis(ms),
            hardware_frame_number: 0,
            dropped_since_last: 0,
            sensor_timestamp_ns: None,
            capture_index: 1,
            fps_estimate: 0.0,
        }
    }

    fn wait_for_file(path: &Path) -> bool {
        for _ in 0..200 {
            if path.exists() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn writes_throttled_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let view = SnapshotView::new(dir.path(), 1.0).unwrap();
        assert!(view.due("cam0", &frame(0)));
        assert!(!view.due("cam0", &frame(500)));
        assert!(view.due("cam1", &frame(500)));

        view.show_frame("cam2", &frame(0));
        assert!(wait_for_file(&view.path_for("cam2")));
    }

    #[test]
    fn show_frame_returns_before_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("snapshots");
        let view = SnapshotView::new(&out, 0.0).unwrap();

        // Far more frames than the writer queue holds; extras are skipped
        for i in 0..64 {
            view.show_frame("cam0", &frame(i));
        }
        assert!(wait_for_file(&view.path_for("cam0")));
    }

    #[test]
    fn aliases_cannot_leave_the_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let view = SnapshotView::new(dir.path(), 1.0).unwrap();

        let path = view.path_for("../left/cam");
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(path.file_name().unwrap(), "___left_cam_preview.jpg");

        view.show_frame("../left/cam", &frame(0));
        assert!(wait_for_file(&path));
    }
}
