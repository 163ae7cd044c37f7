//! Motion-JPEG video writer with a CSV timing log

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use tracing::{debug, info, warn};

use crate::capture::frame::FramePayload;
use crate::StorageConfig;

use super::timing_log::{TimingLog, TimingRow};
use super::{SinkFactory, StorageError, StorageSink, StorageWriteResult};

/// Writes `{alias}_{stamp}.mjpeg` (concatenated JPEG frames),
/// `{alias}_{stamp}_timing.csv` and optional stills into one camera directory.
pub struct MjpegStorage {
    dir: PathBuf,
    alias: String,
    stamp: String,
    quality: u8,
    still_every: u64,
    video: Option<BufWriter<File>>,
    video_path: PathBuf,
    timing: Option<TimingLog>,
    stored: u64,
    fps: f64,
}

impl MjpegStorage {
    pub fn new(dir: &Path, alias: &str, stamp: &str, config: &StorageConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            alias: alias.to_string(),
            stamp: stamp.to_string(),
            quality: config.jpeg_quality.clamp(1, 100),
            still_every: config.still_every,
            video: None,
            video_path: dir.join(format!("{alias}_{stamp}.mjpeg")),
            timing: None,
            stored: 0,
            fps: 0.0,
        }
    }

    pub fn video_path(&self) -> &Path {
        &self.video_path
    }

    pub fn timing_path(&self) -> PathBuf {
        self.dir.join(format!("{}_{}_timing.csv", self.alias, self.stamp))
    }

    fn encode(&self, frame: &RgbImage) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(frame.as_raw(), frame.width(), frame.height(), ExtendedColorType::Rgb8)
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        Ok(out)
    }

    fn write_still(&self, jpeg: &[u8], capture_index: u64) -> Result<PathBuf, StorageError> {
        let path = self
            .dir
            .join(format!("{}_{}_{:08}.jpg", self.alias, self.stamp, capture_index));
        fs::write(&path, jpeg).map_err(|e| StorageError::io(&path, e))?;
        Ok(path)
    }
}

impl StorageSink for MjpegStorage {
    fn start(&mut self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let timing = TimingLog::create(&self.timing_path())?;
        info!("{}: timing log {}", self.alias, timing.path().display());
        self.timing = Some(timing);
        Ok(())
    }

    fn start_video_recording(&mut self, fps_hint: f64) -> Result<(), StorageError> {
        let fd = File::create(&self.video_path).map_err(|e| StorageError::io(&self.video_path, e))?;
        self.video = Some(BufWriter::new(fd));
        self.fps = fps_hint;
        info!(
            "{}: recording video to {} at ~{:.1} fps",
            self.alias,
            self.video_path.display(),
            fps_hint
        );
        Ok(())
    }

    fn write_frame(
        &mut self,
        frame: Option<&RgbImage>,
        payload: &FramePayload,
        fps_hint: f64,
        encoded: Option<&[u8]>,
    ) -> Result<StorageWriteResult, StorageError> {
        if self.timing.is_none() || self.video.is_none() {
            return Err(StorageError::NotStarted);
        }

        let jpeg = match (encoded, frame) {
            (Some(bytes), _) => Some(bytes.to_vec()),
            (None, Some(img)) => match self.encode(img) {
                Ok(jpeg) => Some(jpeg),
                Err(e) => {
                    warn!("{}: frame {} not encoded: {}", self.alias, payload.capture_index, e);
                    None
                }
            },
            (None, None) => None,
        };

        let mut video_written = false;
        if let (Some(jpeg), Some(video)) = (jpeg.as_deref(), self.video.as_mut()) {
            match video.write_all(jpeg) {
                Ok(()) => video_written = true,
                Err(e) => match StorageError::io(&self.video_path, e) {
                    full @ StorageError::DiskFull(_) => return Err(full),
                    other => warn!("{}: video write failed: {}", self.alias, other),
                },
            }
        }

        self.stored += 1;
        let mut still_path = None;
        if self.still_every > 0 && self.stored % self.still_every == 0 {
            if let Some(jpeg) = jpeg.as_deref() {
                still_path = Some(self.write_still(jpeg, payload.capture_index)?);
            }
        }

        let still = still_path.as_deref().and_then(Path::to_str);
        let row = TimingRow::new(payload, video_written, fps_hint, still);
        if let Some(timing) = self.timing.as_mut() {
            timing.append(&row)?;
        }

        Ok(StorageWriteResult {
            still_path,
            video_written,
            fps: fps_hint,
        })
    }

    fn stop(&mut self) -> Result<(), StorageError> {
        if let Some(mut video) = self.video.take() {
            video
                .flush()
                .map_err(|e| StorageError::io(&self.video_path, e))?;
        }
        if let Some(timing) = self.timing.take() {
            timing.finish()?;
        }
        debug!("{}: storage closed after {} frames", self.alias, self.stored);
        Ok(())
    }
}

pub struct MjpegStorageFactory {
    config: StorageConfig,
}

impl MjpegStorageFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }
}

impl SinkFactory for MjpegStorageFactory {
    fn create(&self, dir: &Path, alias: &str, stamp: &str) -> Box<dyn StorageSink> {
        Box::new(MjpegStorage::new(dir, alias, stamp, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::capture::frame::PixelFormat;

    fn payload(index: u64) -> FramePayload {
        FramePayload {
            data: Bytes::from(vec![0u8; 4 * 4 * 3]),
            width: 4,
            height: 4,
            format: PixelFormat::Rgb24,
            wall_time: Utc::now(),
            monotonic: Duration::from_millis(index * 33),
            hardware_frame_number: index,
            dropped_since_last: 0,
            sensor_timestamp_ns: Some(index * 33_000_000),
            capture_index: index,
            fps_estimate: 30.0,
        }
    }

    #[test]
    fn writes_video_timing_and_stills() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            still_every: 2,
            ..Default::default()
        };
        let mut storage = MjpegStorage::new(dir.path(), "cam0", "20240101_000000", &config);
        storage.start().unwrap();
        storage.start_video_recording(30.0).unwrap();

        let img = RgbImage::new(4, 4);
        let first = storage.write_frame(Some(&img), &payload(1), 30.0, None).unwrap();
        let second = storage.write_frame(Some(&img), &payload(2), 30.0, None).unwrap();
        let blank = storage.write_frame(None, &payload(3), 30.0, None).unwrap();
        storage.stop().unwrap();

        assert!(first.video_written && first.still_path.is_none());
        assert!(second.video_written && second.still_path.as_ref().unwrap().exists());
        assert!(!blank.video_written);

        let video = fs::read(storage.video_path()).unwrap();
        assert_eq!(&video[..2], &[0xFF, 0xD8]);

        let mut rdr = csv::Reader::from_path(storage.timing_path()).unwrap();
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[2][6], "false");
    }

    #[test]
    fn encoded_frames_are_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = MjpegStorage::new(dir.path(), "cam1", "s", &StorageConfig::default());
        storage.start().unwrap();
        storage.start_video_recording(15.0).unwrap();
        let jpeg = [0xFF, 0xD8, 0x01, 0xFF, 0xD9];
        let result = storage.write_frame(None, &payload(1), 15.0, Some(&jpeg)).unwrap();
        storage.stop().unwrap();
        assert!(result.video_written);
        assert_eq!(fs::read(storage.video_path()).unwrap(), jpeg);
    }

    #[test]
    fn write_before_start_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = MjpegStorage::new(dir.path(), "cam2", "s", &StorageConfig::default());
        assert!(matches!(
            storage.write_frame(None, &payload(1), 30.0, None),
            Err(StorageError::NotStarted)
        ));
    }
}
