//! Image signal processing contract used by the render path.
//!
//! The vendor ISP is an opaque collaborator; the pipeline only relies on the
//! input/output contracts below. [`SoftwareIsp`] is a plain reference
//! implementation (luma-only conversion, nearest-neighbour upscale).
//!
//! All 4-byte pixel buffers are ARGB_8888 as laid out in memory: `[r, g, b, a]`.

use crate::layout::Resolution;
use crate::types::Rotation;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IspError {
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), IspError> {
    if buf.len() != expected {
        return Err(IspError::BufferSize {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

pub trait ImageProcessor: Send + Sync {
    /// Packed YUV422 (`[Y0, U, Y1, V]`, 2 bytes/pixel) to ARGB.
    fn yuv422_to_argb(&self, src: &[u8], res: Resolution, dest: &mut [u8]) -> Result<(), IspError>;

    /// RGB24 (3 bytes/pixel) to ARGB.
    fn rgb24_to_argb(&self, src: &[u8], res: Resolution, dest: &mut [u8]) -> Result<(), IspError>;

    /// Upscale an ARGB image by an integer factor into `dest`
    /// (`res.pixels() * 4 * multiple²` bytes).
    fn upscale_argb(
        &self,
        src: &[u8],
        res: Resolution,
        multiple: u32,
        dest: &mut [u8],
    ) -> Result<(), IspError>;

    /// Rotate an ARGB image clockwise into `dest` (same byte length as `src`).
    fn rotate_argb(
        &self,
        src: &[u8],
        res: Resolution,
        rotation: Rotation,
        dest: &mut [u8],
    ) -> Result<(), IspError>;
}

/// Reference software ISP.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareIsp;

impl ImageProcessor for SoftwareIsp {
    fn yuv422_to_argb(&self, src: &[u8], res: Resolution, dest: &mut [u8]) -> Result<(), IspError> {
        check_len(src, res.pixels() * 2)?;
        check_len(dest, res.pixels() * 4)?;
        // Luma sits on every even byte.
        for (px, y) in dest.chunks_exact_mut(4).zip(src.iter().step_by(2)) {
            px.copy_from_slice(&[*y, *y, *y, 0xFF]);
        }
        Ok(())
    }

    fn rgb24_to_argb(&self, src: &[u8], res: Resolution, dest: &mut [u8]) -> Result<(), IspError> {
        check_len(src, res.pixels() * 3)?;
        check_len(dest, res.pixels() * 4)?;
        for (px, rgb) in dest.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
            px.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 0xFF]);
        }
        Ok(())
    }

    fn upscale_argb(
        &self,
        src: &[u8],
        res: Resolution,
        multiple: u32,
        dest: &mut [u8],
    ) -> Result<(), IspError> {
        let m = multiple.max(1) as usize;
        let (w, h) = (res.width as usize, res.height as usize);
        check_len(src, w * h * 4)?;
        check_len(dest, w * h * 4 * m * m)?;

        let out_w = w * m;
        for y in 0..h * m {
            let src_row = &src[(y / m) * w * 4..(y / m + 1) * w * 4];
            let dst_row = &mut dest[y * out_w * 4..(y + 1) * out_w * 4];
            for (x, px) in dst_row.chunks_exact_mut(4).enumerate() {
                let sx = (x / m) * 4;
                px.copy_from_slice(&src_row[sx..sx + 4]);
            }
        }
        Ok(())
    }

    fn rotate_argb(
        &self,
        src: &[u8],
        res: Resolution,
        rotation: Rotation,
        dest: &mut [u8],
    ) -> Result<(), IspError> {
        let (w, h) = (res.width as usize, res.height as usize);
        check_len(src, w * h * 4)?;
        check_len(dest, w * h * 4)?;

        for y in 0..h {
            for x in 0..w {
                let (dx, dy, dw) = match rotation {
                    Rotation::Deg0 => (x, y, w),
                    Rotation::Deg90 => (h - 1 - y, x, h),
                    Rotation::Deg180 => (w - 1 - x, h - 1 - y, w),
                    Rotation::Deg270 => (y, w - 1 - x, h),
                };
                let s = (y * w + x) * 4;
                let d = (dy * dw + dx) * 4;
                dest[d..d + 4].copy_from_slice(&src[s..s + 4]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv422_to_argb_takes_luma() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = [100, 128, 200, 128];
        let mut argb = [0u8; 8];
        SoftwareIsp
            .yuv422_to_argb(&yuyv, Resolution::new(2, 1), &mut argb)
            .unwrap();
        assert_eq!(argb, [100, 100, 100, 255, 200, 200, 200, 255]);
    }

    #[test]
    fn test_yuv422_rejects_short_input() {
        let mut argb = [0u8; 8];
        let err = SoftwareIsp
            .yuv422_to_argb(&[1, 2], Resolution::new(2, 1), &mut argb)
            .unwrap_err();
        assert_eq!(err, IspError::BufferSize { expected: 4, actual: 2 });
    }

    #[test]
    fn test_rgb24_to_argb() {
        let mut argb = [0u8; 4];
        SoftwareIsp
            .rgb24_to_argb(&[1, 2, 3], Resolution::new(1, 1), &mut argb)
            .unwrap();
        assert_eq!(argb, [1, 2, 3, 255]);
    }

    #[test]
    fn test_upscale_by_two_replicates_pixels() {
        // 2x1: pixel A then pixel B
        let src = [1, 1, 1, 1, 2, 2, 2, 2];
        let mut dest = [0u8; 2 * 4 * 4];
        SoftwareIsp
            .upscale_argb(&src, Resolution::new(2, 1), 2, &mut dest)
            .unwrap();
        let row: Vec<u8> = dest.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(row, vec![1, 1, 2, 2, 1, 1, 2, 2]);
    }

    #[test]
    fn test_rotate_90_moves_top_left_to_top_right() {
        // 2x1 image rotated 90° becomes 1x2: A on top, B below.
        let src = [1, 0, 0, 0, 2, 0, 0, 0];
        let mut dest = [0u8; 8];
        SoftwareIsp
            .rotate_argb(&src, Resolution::new(2, 1), Rotation::Deg90, &mut dest)
            .unwrap();
        assert_eq!(dest, [1, 0, 0, 0, 2, 0, 0, 0]);

        let src = [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0];
        let mut dest = [0u8; 16];
        SoftwareIsp
            .rotate_argb(&src, Resolution::new(2, 2), Rotation::Deg180, &mut dest)
            .unwrap();
        let order: Vec<u8> = dest.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
    }
}
