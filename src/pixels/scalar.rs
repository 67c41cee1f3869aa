//! Portable row kernel.

use crate::pixels::{nearest, Kernel, ScanoutFormat, BYTES_PER_PIXEL};

/// Reference implementation for all row kernels.
#[derive(Copy, Clone, Default, Debug)]
pub struct Scalar;

impl Kernel for Scalar {
    fn exact(&self, src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
        let pixels = src.chunks_exact(BYTES_PER_PIXEL).zip(dst.chunks_exact_mut(BYTES_PER_PIXEL));
        for (src, dst) in pixels {
            dst.copy_from_slice(&format.convert(src));
        }
    }

    fn expand(&self, src: &[u8], dst: &mut [u8], factor: usize, format: ScanoutFormat) {
        let blocks = dst.chunks_exact_mut(BYTES_PER_PIXEL * factor);
        for (src, block) in src.chunks_exact(BYTES_PER_PIXEL).zip(blocks) {
            let pixel = format.convert(src);
            for dst in block.chunks_exact_mut(BYTES_PER_PIXEL) {
                dst.copy_from_slice(&pixel);
            }
        }
    }
}

/// Nearest-neighbor row resampling.
pub fn resample(src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
    let src_width = src.len() / BYTES_PER_PIXEL;
    let dst_width = dst.len() / BYTES_PER_PIXEL;

    for (x, dst) in dst.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
        let offset = nearest(x, src_width, dst_width) * BYTES_PER_PIXEL;
        dst.copy_from_slice(&format.convert(&src[offset..offset + BYTES_PER_PIXEL]));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expand_repeats() {
        let src = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0xFF; 16];
        Scalar.expand(&src, &mut dst, 2, ScanoutFormat::Xrgb8888);

        assert_eq!(dst, [3, 2, 1, 0, 3, 2, 1, 0, 7, 6, 5, 0, 7, 6, 5, 0]);
    }

    #[test]
    fn resample_down() {
        let src = [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0];
        let mut dst = [0xFF; 8];
        resample(&src, &mut dst, ScanoutFormat::Xbgr8888);

        assert_eq!(dst, [1, 0, 0, 0, 3, 0, 0, 0]);
    }
}
