use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};

/// Timestamp used in session directory and file names.
pub fn session_stamp(now: DateTime<Utc>) -> String {
    now.with_timezone(&Local).format("%Y%m%d_%H%M%S").to_string()
}

/// Replace characters that do not belong in a path component.
pub fn sanitize_alias(alias: &str) -> String {
    let cleaned: String = alias
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "camera".into()
    } else {
        cleaned
    }
}

/// `{session_dir}/{module}/{alias}/`
pub fn camera_output_dir(session_dir: &Path, module: &str, alias: &str) -> PathBuf {
    session_dir.join(module).join(sanitize_alias(alias))
}

#[cfg(feature = "v4l2")]
pub use v4l2_discovery::{auto_detect_devices, FoundDevice};

#[cfg(feature = "v4l2")]
mod v4l2_discovery {
    use std::path::Path;

    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::capture::backend::CameraError;
    use crate::capture::frame::PixelFormat;

    /// Detected capture device info
    #[derive(Debug, Clone)]
    pub struct FoundDevice {
        pub path: String,
        pub card: String,
        pub format: PixelFormat,
    }

    /// Scan `/dev/video*` for capture devices, MJPEG preferred over YUYV.
    pub fn auto_detect_devices() -> Result<Vec<FoundDevice>, CameraError> {
        info!("Auto-detecting capture devices...");

        let mut found = Vec::new();
        for i in 0..64 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }
            let Ok(formats) = dev.enum_formats() else {
                continue;
            };

            let format = if formats.iter().any(|f| f.fourcc == FourCC::new(b"MJPG")) {
                Some(PixelFormat::Mjpeg)
            } else if formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
                Some(PixelFormat::Yuyv4)
            } else {
                None
            };

            if let Some(format) = format {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                found.push(FoundDevice {
                    path,
                    card: caps.card,
                    format,
                });
            }
        }

        if found.is_empty() {
            return Err(CameraError::NoDevice);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_layout() {
        let dir = camera_output_dir(Path::new("/data/s1"), "USBCameras", "left cam/1");
        assert_eq!(dir, PathBuf::from("/data/s1/USBCameras/left_cam_1"));
    }

    #[test]
    fn empty_alias_gets_a_name() {
        assert_eq!(sanitize_alias("  "), "camera");
    }
}
