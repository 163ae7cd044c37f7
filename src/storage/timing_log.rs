//! CSV log with one row per stored frame

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::capture::frame::FramePayload;

use super::StorageError;

#[derive(Debug, Serialize)]
pub struct TimingRow<'a> {
    pub capture_index: u64,
    pub hardware_frame_number: u64,
    pub dropped_since_last: u64,
    pub wall_time: String,
    pub monotonic_ns: u64,
    pub sensor_timestamp_ns: Option<u64>,
    pub video_written: bool,
    pub video_fps: f64,
    pub still_path: Option<&'a str>,
}

impl<'a> TimingRow<'a> {
    pub fn new(payload: &FramePayload, video_written: bool, video_fps: f64, still_path: Option<&'a str>) -> Self {
        Self {
            capture_index: payload.capture_index,
            hardware_frame_number: payload.hardware_frame_number,
            dropped_since_last: payload.dropped_since_last,
            wall_time: payload.wall_time.to_rfc3339(),
            monotonic_ns: payload.monotonic_ns(),
            sensor_timestamp_ns: payload.sensor_timestamp_ns,
            video_written,
            video_fps,
            still_path,
        }
    }
}

pub struct TimingLog {
    path: PathBuf,
    wtr: csv::Writer<BufWriter<File>>,
}

impl TimingLog {
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        let fd = File::create(path).map_err(|e| StorageError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            wtr: csv::Writer::from_writer(BufWriter::new(fd)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, row: &TimingRow<'_>) -> Result<(), StorageError> {
        self.wtr.serialize(row)?;
        self.wtr.flush().map_err(|e| StorageError::io(&self.path, e))
    }

    pub fn finish(mut self) -> Result<(), StorageError> {
        self.wtr.flush().map_err(|e| StorageError::io(&self.path, e))
    }
}
