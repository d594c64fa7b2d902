//! Conversion from raw camera frames to packed I420 for the video track.
//!
//! The output is stride-correct: each plane's row stride equals its width.
//! Frames larger than the 320x240 streaming bound are cropped to the
//! target aspect and scaled down so the track encoder never sees large
//! inputs.

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::error::FrameError;
use crate::frame::{monotonic_ns, I420Frame, RawFrame, STREAM_HEIGHT, STREAM_WIDTH};

use super::pack_plane;

/// Raw-to-I420 converter targeting the streaming resolution.
#[derive(Debug, Clone, Default)]
pub struct I420Converter;

impl I420Converter {
    pub fn new() -> Self {
        Self
    }

    /// Produce a packed 320x240 I420 frame, tagged rotation 0 and a fresh
    /// monotonic timestamp.
    pub fn convert(&self, frame: &RawFrame) -> Result<I420Frame, FrameError> {
        frame.validate()?;

        let (w, h) = (frame.width as usize, frame.height as usize);
        let (cw, ch) = (frame.chroma_width() as usize, frame.chroma_height() as usize);

        let mut y = Vec::with_capacity(w * h);
        pack_plane(&frame.y, w, h, &mut y);
        let mut u = Vec::with_capacity(cw * ch);
        pack_plane(&frame.u, cw, ch, &mut u);
        let mut v = Vec::with_capacity(cw * ch);
        pack_plane(&frame.v, cw, ch, &mut v);

        if frame.width == STREAM_WIDTH && frame.height == STREAM_HEIGHT {
            return Ok(I420Frame {
                width: STREAM_WIDTH,
                height: STREAM_HEIGHT,
                rotation: 0,
                timestamp_ns: monotonic_ns(),
                y: Bytes::from(y),
                u: Bytes::from(u),
                v: Bytes::from(v),
            });
        }

        // Center crop to the target aspect, on even boundaries so the
        // chroma planes stay aligned.
        let (crop_w, crop_h) = crop_region(frame.width, frame.height);
        let x0 = (((frame.width - crop_w) / 2) & !1) as usize;
        let y0 = (((frame.height - crop_h) / 2) & !1) as usize;

        let y = scale_plane(&y, w, h, x0, y0, crop_w as usize, crop_h as usize,
            STREAM_WIDTH, STREAM_HEIGHT)?;
        let u = scale_plane(&u, cw, ch, x0 / 2, y0 / 2,
            crop_w as usize / 2, crop_h as usize / 2,
            STREAM_WIDTH / 2, STREAM_HEIGHT / 2)?;
        let v = scale_plane(&v, cw, ch, x0 / 2, y0 / 2,
            crop_w as usize / 2, crop_h as usize / 2,
            STREAM_WIDTH / 2, STREAM_HEIGHT / 2)?;

        Ok(I420Frame {
            width: STREAM_WIDTH,
            height: STREAM_HEIGHT,
            rotation: 0,
            timestamp_ns: monotonic_ns(),
            y: Bytes::from(y),
            u: Bytes::from(u),
            v: Bytes::from(v),
        })
    }
}

/// Largest even-sized region of the source matching the stream aspect.
fn crop_region(width: u32, height: u32) -> (u32, u32) {
    let by_height = height * STREAM_WIDTH / STREAM_HEIGHT;
    if by_height <= width {
        (by_height & !1, height & !1)
    } else {
        (width & !1, (width * STREAM_HEIGHT / STREAM_WIDTH) & !1)
    }
}

#[allow(clippy::too_many_arguments)]
fn scale_plane(
    packed: &[u8],
    src_w: usize,
    src_h: usize,
    x0: usize,
    y0: usize,
    crop_w: usize,
    crop_h: usize,
    dst_w: u32,
    dst_h: u32,
) -> Result<Vec<u8>, FrameError> {
    let img = GrayImage::from_raw(src_w as u32, src_h as u32, packed.to_vec())
        .ok_or_else(|| FrameError::Convert("plane buffer size mismatch".into()))?;
    let cropped =
        imageops::crop_imm(&img, x0 as u32, y0 as u32, crop_w as u32, crop_h as u32).to_image();
    let scaled = imageops::resize(&cropped, dst_w, dst_h, FilterType::Triangle);
    Ok(scaled.into_raw())
}
