//! Frame types shared across the capture, conversion, and streaming layers.
//!
//! A [`RawFrame`] is what the camera produces: three YUV planes, each with
//! its own row- and pixel-stride, so padded and semi-planar layouts can be
//! described without copying. Converters turn it into either a packed
//! [`I420Frame`] for the WebRTC track or an [`EncodedJpeg`] for the
//! fallback broadcast.

use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Wire-constant width of outgoing stream frames (both WebRTC and JPEG).
pub const STREAM_WIDTH: u32 = 320;

/// Wire-constant height of outgoing stream frames.
pub const STREAM_HEIGHT: u32 = 240;

/// Default JPEG quality for the fallback broadcast.
pub const DEFAULT_JPEG_QUALITY: u8 = 45;

/// Monotonic nanoseconds since the first call in this process.
///
/// Frame timestamps must be strictly increasing within a session and are
/// never compared across processes, so a process-local origin is enough.
pub fn monotonic_ns() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// One image plane with explicit memory layout.
///
/// `row_stride` is the byte distance between the starts of consecutive
/// rows; `pixel_stride` the distance between horizontally adjacent samples.
/// A tightly packed plane has `pixel_stride == 1` and `row_stride == width`.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    /// A tightly packed plane of the given width.
    pub fn packed(data: impl Into<Bytes>, width: usize) -> Self {
        Self {
            data: data.into(),
            row_stride: width,
            pixel_stride: 1,
        }
    }

    /// Sample at (x, y) honoring both strides.
    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.row_stride + x * self.pixel_stride]
    }
}

/// A captured camera frame in planar or semi-planar YUV 4:2:0.
///
/// Owned by the router during dispatch; consumers copy what they need and
/// must not retain the frame past the dispatch call.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation to apply for upright display, in degrees.
    pub rotation: u32,
    /// Capture timestamp, monotonic nanoseconds.
    pub timestamp_ns: u64,
    pub y: Plane,
    pub u: Plane,
    pub v: Plane,
}

impl RawFrame {
    /// Build a frame from tightly packed I420 planes.
    pub fn from_packed(
        width: u32,
        height: u32,
        timestamp_ns: u64,
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
    ) -> Self {
        let cw = (width / 2) as usize;
        Self {
            width,
            height,
            rotation: 0,
            timestamp_ns,
            y: Plane::packed(y, width as usize),
            u: Plane::packed(u, cw),
            v: Plane::packed(v, cw),
        }
    }

    /// Chroma plane width (4:2:0 subsampling).
    pub fn chroma_width(&self) -> u32 {
        self.width / 2
    }

    /// Chroma plane height (4:2:0 subsampling).
    pub fn chroma_height(&self) -> u32 {
        self.height / 2
    }

    /// Check the structural invariants: positive even dimensions and plane
    /// buffers large enough for their declared strides.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(FrameError::BadDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let check = |plane: &Plane, w: usize, h: usize, name: &'static str| {
            if h == 0 {
                return Ok(());
            }
            let needed = (h - 1) * plane.row_stride + (w - 1) * plane.pixel_stride + 1;
            if plane.data.len() < needed {
                Err(FrameError::ShortPlane {
                    plane: name,
                    needed,
                    actual: plane.data.len(),
                })
            } else {
                Ok(())
            }
        };
        check(&self.y, self.width as usize, self.height as usize, "y")?;
        let (cw, ch) = (self.chroma_width() as usize, self.chroma_height() as usize);
        check(&self.u, cw, ch, "u")?;
        check(&self.v, cw, ch, "v")?;
        Ok(())
    }
}

/// A packed I420 frame ready for the video track.
///
/// Row strides equal the plane widths; there is no padding.
#[derive(Debug, Clone)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub rotation: u32,
    pub timestamp_ns: u64,
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
}

impl I420Frame {
    /// Concatenate the planes into the contiguous Y-U-V layout encoders take.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.y.len() + self.u.len() + self.v.len());
        buf.extend_from_slice(&self.y);
        buf.extend_from_slice(&self.u);
        buf.extend_from_slice(&self.v);
        buf
    }
}

/// One encoded JPEG image for the fallback broadcast.
#[derive(Debug, Clone)]
pub struct EncodedJpeg {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

/// Which camera to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraLens {
    Front,
    Back,
}

impl CameraLens {
    /// The opposite lens.
    pub fn other(self) -> Self {
        match self {
            CameraLens::Front => CameraLens::Back,
            CameraLens::Back => CameraLens::Front,
        }
    }

    /// Whether the sink must mirror the image (mirroring is delegated to
    /// the sink's GPU layer).
    pub fn is_front(self) -> bool {
        self == CameraLens::Front
    }
}

/// Whether the camera feeds the preview alone or preview plus dispatch.
///
/// Exactly one mode is active per camera instance at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMode {
    PreviewOnly,
    Streaming,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_frame(width: u32, height: u32) -> RawFrame {
        let (w, h) = (width as usize, height as usize);
        RawFrame::from_packed(
            width,
            height,
            1,
            vec![0u8; w * h],
            vec![0u8; w * h / 4],
            vec![0u8; w * h / 4],
        )
    }

    #[test]
    fn packed_frame_validates() {
        packed_frame(320, 240).validate().unwrap();
    }

    #[test]
    fn odd_dimensions_rejected() {
        let mut frame = packed_frame(320, 240);
        frame.width = 321;
        assert!(matches!(
            frame.validate(),
            Err(FrameError::BadDimensions { .. })
        ));
    }

    #[test]
    fn zero_dimensions_rejected() {
        let mut frame = packed_frame(320, 240);
        frame.height = 0;
        assert!(frame.validate().is_err());
    }

    #[test]
    fn short_plane_rejected() {
        let mut frame = packed_frame(320, 240);
        frame.u = Plane::packed(vec![0u8; 10], 160);
        assert!(matches!(
            frame.validate(),
            Err(FrameError::ShortPlane { plane: "u", .. })
        ));
    }

    #[test]
    fn padded_rows_validate() {
        // Row stride 352 at width 320: padded rows, still a legal layout.
        let mut frame = packed_frame(320, 240);
        frame.y = Plane {
            data: Bytes::from(vec![0u8; 352 * 240]),
            row_stride: 352,
            pixel_stride: 1,
        };
        frame.validate().unwrap();
    }

    #[test]
    fn plane_sample_honors_strides() {
        let mut data = vec![0u8; 8 * 4];
        data[2 * 8 + 3 * 2] = 0xAB; // row 2, sample 3, pixel stride 2
        let plane = Plane {
            data: Bytes::from(data),
            row_stride: 8,
            pixel_stride: 2,
        };
        assert_eq!(plane.sample(3, 2), 0xAB);
    }

    #[test]
    fn lens_other_is_involution() {
        assert_eq!(CameraLens::Front.other().other(), CameraLens::Front);
        assert!(CameraLens::Front.is_front());
        assert!(!CameraLens::Back.is_front());
    }

    #[test]
    fn monotonic_ns_increases() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn i420_contiguous_layout() {
        let frame = I420Frame {
            width: 4,
            height: 2,
            rotation: 0,
            timestamp_ns: 0,
            y: Bytes::from(vec![1u8; 8]),
            u: Bytes::from(vec![2u8; 2]),
            v: Bytes::from(vec![3u8; 2]),
        };
        let buf = frame.to_contiguous();
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[..8], &[1u8; 8][..]);
        assert_eq!(&buf[8..10], &[2u8; 2][..]);
        assert_eq!(&buf[10..], &[3u8; 2][..]);
    }
}
