//! NEON row kernel.

use std::arch::aarch64::{uint8x8x4_t, vdup_n_u8, vld4_u8, vst4_u8, vzip_u8};

use crate::pixels::{Kernel, Scalar, ScanoutFormat, BYTES_PER_PIXEL};

/// Pixels converted per loop iteration.
const BATCH: usize = 8;

/// Deinterleaving load/store kernel.
#[derive(Copy, Clone, Default, Debug)]
pub struct Neon;

impl Kernel for Neon {
    fn exact(&self, src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
        // SAFETY: NEON is mandatory on aarch64.
        unsafe { exact(src, dst, format) }
    }

    fn expand(&self, src: &[u8], dst: &mut [u8], factor: usize, format: ScanoutFormat) {
        match factor {
            // SAFETY: NEON is mandatory on aarch64.
            2 => unsafe { expand2(src, dst, format) },
            4 => unsafe { expand4(src, dst, format) },
            _ => Scalar.expand(src, dst, factor, format),
        }
    }
}

/// Move deinterleaved RGBA lanes into destination channel order.
#[inline(always)]
unsafe fn reorder(pixels: uint8x8x4_t, format: ScanoutFormat) -> uint8x8x4_t {
    let zero = vdup_n_u8(0);
    match format {
        ScanoutFormat::Xrgb8888 => uint8x8x4_t(pixels.2, pixels.1, pixels.0, zero),
        ScanoutFormat::Xbgr8888 => uint8x8x4_t(pixels.0, pixels.1, pixels.2, zero),
    }
}

/// Duplicate every lane, returning the low and high half.
#[inline(always)]
unsafe fn double(pixels: uint8x8x4_t) -> (uint8x8x4_t, uint8x8x4_t) {
    let c0 = vzip_u8(pixels.0, pixels.0);
    let c1 = vzip_u8(pixels.1, pixels.1);
    let c2 = vzip_u8(pixels.2, pixels.2);
    let c3 = vzip_u8(pixels.3, pixels.3);
    (uint8x8x4_t(c0.0, c1.0, c2.0, c3.0), uint8x8x4_t(c0.1, c1.1, c2.1, c3.1))
}

unsafe fn exact(src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
    let pixels = (src.len() / BYTES_PER_PIXEL).min(dst.len() / BYTES_PER_PIXEL);
    let simd_end = pixels - pixels % BATCH;

    let mut x = 0;
    while x < simd_end {
        let offset = x * BYTES_PER_PIXEL;
        let converted = reorder(vld4_u8(src.as_ptr().add(offset)), format);
        vst4_u8(dst.as_mut_ptr().add(offset), converted);
        x += BATCH;
    }

    let tail = simd_end * BYTES_PER_PIXEL..pixels * BYTES_PER_PIXEL;
    Scalar.exact(&src[tail.clone()], &mut dst[tail], format);
}

unsafe fn expand2(src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
    let pixels = (src.len() / BYTES_PER_PIXEL).min(dst.len() / (BYTES_PER_PIXEL * 2));
    let simd_end = pixels - pixels % BATCH;

    let mut x = 0;
    while x < simd_end {
        let converted = reorder(vld4_u8(src.as_ptr().add(x * BYTES_PER_PIXEL)), format);
        let (low, high) = double(converted);

        let out = dst.as_mut_ptr().add(x * 2 * BYTES_PER_PIXEL);
        vst4_u8(out, low);
        vst4_u8(out.add(BATCH * BYTES_PER_PIXEL), high);
        x += BATCH;
    }

    let src_tail = simd_end * BYTES_PER_PIXEL..pixels * BYTES_PER_PIXEL;
    let dst_tail = simd_end * 2 * BYTES_PER_PIXEL..pixels * 2 * BYTES_PER_PIXEL;
    Scalar.expand(&src[src_tail], &mut dst[dst_tail], 2, format);
}

unsafe fn expand4(src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
    let pixels = (src.len() / BYTES_PER_PIXEL).min(dst.len() / (BYTES_PER_PIXEL * 4));
    let simd_end = pixels - pixels % BATCH;

    let mut x = 0;
    while x < simd_end {
        let converted = reorder(vld4_u8(src.as_ptr().add(x * BYTES_PER_PIXEL)), format);
        let (low, high) = double(converted);
        let (first, second) = double(low);
        let (third, fourth) = double(high);

        let out = dst.as_mut_ptr().add(x * 4 * BYTES_PER_PIXEL);
        for (i, block) in [first, second, third, fourth].into_iter().enumerate() {
            vst4_u8(out.add(i * BATCH * BYTES_PER_PIXEL), block);
        }
        x += BATCH;
    }

    let src_tail = simd_end * BYTES_PER_PIXEL..pixels * BYTES_PER_PIXEL;
    let dst_tail = simd_end * 4 * BYTES_PER_PIXEL..pixels * 4 * BYTES_PER_PIXEL;
    Scalar.expand(&src[src_tail], &mut dst[dst_tail], 4, format);
}
