//! Pixel format conversion to the encoder's RGB24 input

use image::{imageops, imageops::FilterType, RgbImage};

use super::frame::{FramePayload, PixelFormat};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(String),
    #[error("{format:?} buffer of {actual} bytes, expected {expected} for {width}x{height}")]
    ShortBuffer {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

pub fn decode_frame(data: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<RgbImage, DecodeError> {
    if let Some(expected) = format.frame_len(width, height) {
        if data.len() < expected {
            return Err(DecodeError::ShortBuffer {
                format,
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
    }

    let (w, h) = (width as usize, height as usize);
    let pixels = match format {
        PixelFormat::Mjpeg => {
            let mut decoder = zune_jpeg::JpegDecoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| DecodeError::Jpeg(format!("{e:?}")))?;
            let (dw, dh) = decoder
                .dimensions()
                .map(|(dw, dh)| (dw as u32, dh as u32))
                .unwrap_or((width, height));
            return RgbImage::from_raw(dw, dh, pixels)
                .ok_or_else(|| DecodeError::Jpeg("decoded buffer does not match dimensions".into()));
        }
        // Already in RGB format
        PixelFormat::Rgb24 => data[..w * h * 3].to_vec(),
        PixelFormat::Bgr24 => {
            let mut out = data[..w * h * 3].to_vec();
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            out
        }
        PixelFormat::Yuyv4 => {
            let mut out = Vec::with_capacity(w * h * 3);
            for quad in data[..w * h * 2].chunks_exact(4) {
                let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                out.extend_from_slice(&yuv_to_rgb(y0, u, v));
                out.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            out
        }
        PixelFormat::Nv12 => {
            let (luma, chroma) = data.split_at(w * h);
            let mut out = Vec::with_capacity(w * h * 3);
            for row in 0..h {
                for col in 0..w {
                    let c = (row / 2) * w + (col & !1);
                    let (u, v) = match (chroma.get(c), chroma.get(c + 1)) {
                        (Some(&u), Some(&v)) => (u, v),
                        _ => (128, 128),
                    };
                    out.extend_from_slice(&yuv_to_rgb(luma[row * w + col], u, v));
                }
            }
            out
        }
    };

    // The length checks above guarantee the buffer size
    RgbImage::from_raw(width, height, pixels).ok_or(DecodeError::ShortBuffer {
        format,
        width,
        height,
        expected: w * h * 3,
        actual: 0,
    })
}

/// BT.601 limited-range conversion
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [
        r.clamp(0.0, 255.0) as u8,
        g.clamp(0.0, 255.0) as u8,
        b.clamp(0.0, 255.0) as u8,
    ]
}

/// Output of converting a payload for the video encoder.
pub enum EncoderInput {
    /// Decoded frame at the target size
    Rgb(RgbImage),
    /// MJPEG bytes that already match the target and can be written untouched
    Encoded(bytes::Bytes),
}

/// Convert `payload` into what the encoder expects, resizing when `target` differs.
pub fn prepare_for_encoder(
    payload: &FramePayload,
    target: Option<(u32, u32)>,
) -> Result<EncoderInput, DecodeError> {
    let (tw, th) = target.unwrap_or((payload.width, payload.height));

    if payload.format == PixelFormat::Mjpeg && (tw, th) == (payload.width, payload.height) {
        return Ok(EncoderInput::Encoded(payload.data.clone()));
    }

    let rgb = decode_frame(&payload.data, payload.width, payload.height, payload.format)?;
    if rgb.dimensions() == (tw, th) {
        Ok(EncoderInput::Rgb(rgb))
    } else {
        Ok(EncoderInput::Rgb(imageops::resize(&rgb, tw, th, FilterType::Triangle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let rgb = decode_frame(&[1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Bgr24).unwrap();
        assert_eq!(rgb.into_raw(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn yuyv_grey_stays_grey() {
        // Y=126 U=V=128 is mid grey
        let rgb = decode_frame(&[126, 128, 126, 128], 2, 1, PixelFormat::Yuyv4).unwrap();
        let raw = rgb.into_raw();
        assert!(raw.iter().all(|&c| (c as i32 - raw[0] as i32).abs() <= 1));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = decode_frame(&[0; 5], 2, 1, PixelFormat::Rgb24).unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer { expected: 6, .. }));
    }

    #[test]
    fn nv12_converts_to_full_rgb() {
        let width = 4;
        let height = 2;
        let mut data = vec![200u8; 8];
        data.extend_from_slice(&[128, 128, 128, 128]);
        let rgb = decode_frame(&data, width, height, PixelFormat::Nv12).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
    }
}
