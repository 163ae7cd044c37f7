//! Per-camera storage: video stream, timing log and stills

pub mod mjpeg;
pub mod timing_log;

use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::capture::frame::FramePayload;

pub use mjpeg::{MjpegStorage, MjpegStorageFactory};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("disk full while writing {0}")]
    DiskFull(PathBuf),
    #[error("timing log error: {0}")]
    Csv(#[from] csv::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("storage not started")]
    NotStarted,
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::StorageFull {
            StorageError::DiskFull(path)
        } else {
            StorageError::Io { path, source }
        }
    }
}

/// Outcome of one `write_frame` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageWriteResult {
    pub still_path: Option<PathBuf>,
    pub video_written: bool,
    /// Frame rate hint the video writer was given
    pub fps: f64,
}

/// Storage pipeline boundary used by the storage consumer.
///
/// Calls block; the consumer runs them on the blocking thread pool.
/// An `Err` is a fatal storage condition; a frame that merely failed to
/// reach the video is reported through `video_written = false`.
pub trait StorageSink: Send + 'static {
    fn start(&mut self) -> Result<(), StorageError>;

    fn start_video_recording(&mut self, fps_hint: f64) -> Result<(), StorageError>;

    /// `frame` is the converted image, `encoded` a frame already in the
    /// video's encoding. Either or both may be absent.
    fn write_frame(
        &mut self,
        frame: Option<&RgbImage>,
        payload: &FramePayload,
        fps_hint: f64,
        encoded: Option<&[u8]>,
    ) -> Result<StorageWriteResult, StorageError>;

    fn stop(&mut self) -> Result<(), StorageError>;
}

/// Creates one sink per camera when a recording starts.
pub trait SinkFactory: Send + Sync {
    fn create(&self, dir: &Path, alias: &str, stamp: &str) -> Box<dyn StorageSink>;
}
