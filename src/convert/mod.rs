//! Frame conversion: raw YUV planes to packed I420 or scaled JPEG.
//!
//! Both converters share the stride-aware plane copy below. Source planes
//! come in three layouts and each gets its own copy path:
//!
//! - tightly packed (`pixel_stride == 1`, `row_stride == width`): one bulk copy
//! - row-padded (`pixel_stride == 1`): one copy per row
//! - semi-planar/interleaved (`pixel_stride > 1`): one copy per sample

pub mod i420;
pub mod jpeg;

pub use i420::I420Converter;
pub use jpeg::JpegEncoder;

use crate::frame::Plane;

/// Append `width * height` samples of `src` to `dst`, packed.
pub(crate) fn pack_plane(src: &Plane, width: usize, height: usize, dst: &mut Vec<u8>) {
    if src.pixel_stride == 1 && src.row_stride == width {
        dst.extend_from_slice(&src.data[..width * height]);
    } else if src.pixel_stride == 1 {
        for row in 0..height {
            let start = row * src.row_stride;
            dst.extend_from_slice(&src.data[start..start + width]);
        }
    } else {
        for row in 0..height {
            let start = row * src.row_stride;
            for col in 0..width {
                dst.push(src.data[start + col * src.pixel_stride]);
            }
        }
    }
}

/// Interleave V and U planes into NV21 chroma (VUVU...), honoring strides.
pub(crate) fn interleave_vu(u: &Plane, v: &Plane, width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height * 2);
    for row in 0..height {
        for col in 0..width {
            out.push(v.sample(col, row));
            out.push(u.sample(col, row));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn pack_plane_bulk_path() {
        let plane = Plane::packed(vec![1, 2, 3, 4, 5, 6], 3);
        let mut out = Vec::new();
        pack_plane(&plane, 3, 2, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn pack_plane_row_padded_path() {
        // width 3, row stride 4: one padding byte per row is skipped
        let plane = Plane {
            data: Bytes::from(vec![1, 2, 3, 9, 4, 5, 6, 9]),
            row_stride: 4,
            pixel_stride: 1,
        };
        let mut out = Vec::new();
        pack_plane(&plane, 3, 2, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn pack_plane_per_pixel_path() {
        // pixel stride 2: every other byte belongs to the other plane
        let plane = Plane {
            data: Bytes::from(vec![1, 9, 2, 9, 3, 9, 4, 9]),
            row_stride: 4,
            pixel_stride: 2,
        };
        let mut out = Vec::new();
        pack_plane(&plane, 2, 2, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn interleave_vu_orders_v_first() {
        let u = Plane::packed(vec![10, 11, 12, 13], 2);
        let v = Plane::packed(vec![20, 21, 22, 23], 2);
        let out = interleave_vu(&u, &v, 2, 2);
        assert_eq!(out, vec![20, 10, 21, 11, 22, 12, 23, 13]);
    }

    #[test]
    fn interleave_vu_from_semiplanar_source() {
        // Semi-planar chroma: U and V views share interleaved storage with
        // pixel stride 2. The copy must go sample-by-sample.
        let storage: Vec<u8> = vec![20, 10, 21, 11, 22, 12, 23, 13];
        let v = Plane {
            data: Bytes::from(storage.clone()),
            row_stride: 4,
            pixel_stride: 2,
        };
        let u = Plane {
            data: Bytes::from(storage[1..].to_vec()),
            row_stride: 4,
            pixel_stride: 2,
        };
        let out = interleave_vu(&u, &v, 2, 2);
        assert_eq!(out, vec![20, 10, 21, 11, 22, 12, 23, 13]);
    }
}
