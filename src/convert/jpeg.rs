//! JPEG encoding for the fallback broadcast.
//!
//! The output is bounded to 320x240 while mirroring the source aspect
//! ratio. Encoding happens at the source dimensions first; when the source
//! already fits the bound, that single encode is the result. Otherwise the
//! intermediate is decoded, uniformly scaled, and re-encoded.
//!
//! Front-lens mirroring is NOT applied here; the sink's GPU layer mirrors
//! based on the front-camera flag it receives at session start.

use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;

use crate::error::FrameError;
use crate::frame::{EncodedJpeg, RawFrame, STREAM_HEIGHT, STREAM_WIDTH};

use super::{interleave_vu, pack_plane};

/// YUV-to-JPEG encoder with a fixed output bound.
#[derive(Debug, Clone)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    /// Encode a raw frame to a JPEG no larger than 320x240.
    pub fn encode(&self, frame: &RawFrame) -> Result<EncodedJpeg, FrameError> {
        frame.validate()?;

        let (w, h) = (frame.width, frame.height);
        let nv21 = nv21_from_frame(frame);
        let rgb = nv21_to_rgb(&nv21, w as usize, h as usize);
        let full = encode_rgb(&rgb, w, h, self.quality)?;

        // Fast path: source already fits the bound, single encode.
        if w <= STREAM_WIDTH && h <= STREAM_HEIGHT {
            return Ok(EncodedJpeg {
                data: Bytes::from(full),
                width: w,
                height: h,
                quality: self.quality,
            });
        }

        let decoded = image::load_from_memory(&full)
            .map_err(|e| FrameError::Jpeg(format!("intermediate decode: {e}")))?
            .to_rgb8();

        let scale = f64::min(
            STREAM_WIDTH as f64 / w as f64,
            STREAM_HEIGHT as f64 / h as f64,
        );
        let tw = ((w as f64 * scale).round() as u32).max(1);
        let th = ((h as f64 * scale).round() as u32).max(1);

        let resized = image::imageops::resize(&decoded, tw, th, FilterType::Lanczos3);
        let data = encode_rgb(resized.as_raw(), tw, th, self.quality)?;

        Ok(EncodedJpeg {
            data: Bytes::from(data),
            width: tw,
            height: th,
            quality: self.quality,
        })
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(crate::frame::DEFAULT_JPEG_QUALITY)
    }
}

/// Build an NV21 buffer (packed Y followed by interleaved VU) from the
/// frame's planes, whatever their strides.
fn nv21_from_frame(frame: &RawFrame) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let (cw, ch) = (frame.chroma_width() as usize, frame.chroma_height() as usize);

    let mut nv21 = Vec::with_capacity(w * h + cw * ch * 2);
    pack_plane(&frame.y, w, h, &mut nv21);
    nv21.extend_from_slice(&interleave_vu(&frame.u, &frame.v, cw, ch));
    nv21
}

/// BT.601 limited-range NV21 to RGB24.
fn nv21_to_rgb(nv21: &[u8], width: usize, height: usize) -> Vec<u8> {
    let y_plane = &nv21[..width * height];
    let vu_plane = &nv21[width * height..];

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as i32;
            let vu_idx = (row / 2) * width + (col / 2) * 2;
            let v = vu_plane[vu_idx] as i32;
            let u = vu_plane[vu_idx + 1] as i32;

            let c = 298 * (y - 16);
            let r = (c + 409 * (v - 128) + 128) >> 8;
            let g = (c - 100 * (u - 128) - 208 * (v - 128) + 128) >> 8;
            let b = (c + 516 * (u - 128) + 128) >> 8;

            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }
    rgb
}

fn encode_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut out = Cursor::new(Vec::new());
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb, width, height, image::ExtendedColorType::Rgb8)
        .map_err(|e| FrameError::Jpeg(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Plane;
    use bytes::Bytes;

    /// A mid-gray frame: Y=128, U=V=128 decodes to neutral gray.
    fn gray_frame(width: u32, height: u32) -> RawFrame {
        let (w, h) = (width as usize, height as usize);
        RawFrame::from_packed(
            width,
            height,
            1,
            vec![128u8; w * h],
            vec![128u8; w * h / 4],
            vec![128u8; w * h / 4],
        )
    }

    #[test]
    fn small_frame_takes_fast_path() {
        let jpeg = JpegEncoder::new(45).encode(&gray_frame(320, 240)).unwrap();
        assert_eq!((jpeg.width, jpeg.height), (320, 240));
        assert_eq!(jpeg.quality, 45);
        // JFIF magic
        assert_eq!(&jpeg.data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn large_frame_is_scaled_to_bound() {
        let jpeg = JpegEncoder::new(45).encode(&gray_frame(1280, 720)).unwrap();
        // min(320/1280, 240/720) = 0.25
        assert_eq!((jpeg.width, jpeg.height), (320, 180));
    }

    #[test]
    fn portrait_frame_scales_on_height() {
        let jpeg = JpegEncoder::new(45).encode(&gray_frame(480, 640)).unwrap();
        // min(320/480, 240/640) = 0.375 -> 180x240
        assert_eq!((jpeg.width, jpeg.height), (180, 240));
    }

    #[test]
    fn padded_rows_produce_same_image_as_packed() {
        let packed = gray_frame(320, 240);

        // Same pixels behind a row stride of 352 with garbage in the pad.
        let mut y = Vec::with_capacity(352 * 240);
        for _ in 0..240 {
            y.extend_from_slice(&[128u8; 320]);
            y.extend_from_slice(&[7u8; 32]);
        }
        let mut padded = gray_frame(320, 240);
        padded.y = Plane {
            data: Bytes::from(y),
            row_stride: 352,
            pixel_stride: 1,
        };

        let encoder = JpegEncoder::new(45);
        let a = encoder.encode(&packed).unwrap();
        let b = encoder.encode(&padded).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn gray_input_decodes_to_gray_without_fringing() {
        let jpeg = JpegEncoder::new(90).encode(&gray_frame(320, 240)).unwrap();
        let img = image::load_from_memory(&jpeg.data).unwrap().to_rgb8();
        let px = img.get_pixel(160, 120);
        for channel in px.0 {
            assert!(
                (118..=138).contains(&channel),
                "expected neutral gray, got {:?}",
                px.0
            );
        }
    }

    #[test]
    fn nv21_to_rgb_black_and_white() {
        // Y=16 is black, Y=235 is white in limited range.
        let mut nv21 = vec![16u8, 235, 16, 235];
        nv21.extend_from_slice(&[128, 128]); // one VU pair for the 2x2 block
        let rgb = nv21_to_rgb(&nv21, 2, 2);
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert!(rgb[3] > 250 && rgb[4] > 250 && rgb[5] > 250);
    }

    #[test]
    fn invalid_frame_is_rejected() {
        let mut frame = gray_frame(320, 240);
        frame.width = 321;
        assert!(JpegEncoder::default().encode(&frame).is_err());
    }
}
