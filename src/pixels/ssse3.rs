//! SSSE3 row kernel.

use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_shuffle_epi8, _mm_storeu_si128};

use crate::pixels::{Kernel, Scalar, ScanoutFormat, BYTES_PER_PIXEL};

/// Pixels converted per loop iteration.
const BATCH: usize = 8;

/// Shuffle mask index clearing the destination byte.
const ZERO: u8 = 0x80;

/// Byte shuffle kernel, only constructible on CPUs with SSSE3.
#[derive(Copy, Clone, Debug)]
pub struct Ssse3 {
    _private: (),
}

impl Ssse3 {
    pub fn detect() -> Option<Self> {
        is_x86_feature_detected!("ssse3").then_some(Self { _private: () })
    }
}

impl Kernel for Ssse3 {
    fn exact(&self, src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
        // SAFETY: Construction guarantees SSSE3 support.
        unsafe { exact(src, dst, format) }
    }

    fn expand(&self, src: &[u8], dst: &mut [u8], factor: usize, format: ScanoutFormat) {
        match factor {
            // SAFETY: Construction guarantees SSSE3 support.
            2 | 4 => unsafe { expand(src, dst, factor, format) },
            _ => Scalar.expand(src, dst, factor, format),
        }
    }
}

/// Shuffle mask writing the source pixels `sources` as four destination pixels.
fn mask(format: ScanoutFormat, sources: [usize; 4]) -> [u8; 16] {
    let channels = format.source_channels();

    let mut mask = [ZERO; 16];
    for (pixel, source) in sources.iter().enumerate() {
        for (channel, offset) in channels.iter().enumerate() {
            mask[pixel * BYTES_PER_PIXEL + channel] = (source * BYTES_PER_PIXEL + offset) as u8;
        }
    }
    mask
}

#[target_feature(enable = "ssse3")]
unsafe fn exact(src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
    let pixels = (src.len() / BYTES_PER_PIXEL).min(dst.len() / BYTES_PER_PIXEL);
    let simd_end = pixels - pixels % BATCH;

    let mask = mask(format, [0, 1, 2, 3]);
    let mask = _mm_loadu_si128(mask.as_ptr() as *const __m128i);

    let mut x = 0;
    while x < simd_end {
        for offset in [x * BYTES_PER_PIXEL, (x + 4) * BYTES_PER_PIXEL] {
            let pixels = _mm_loadu_si128(src.as_ptr().add(offset) as *const __m128i);
            let out = dst.as_mut_ptr().add(offset) as *mut __m128i;
            _mm_storeu_si128(out, _mm_shuffle_epi8(pixels, mask));
        }
        x += BATCH;
    }

    let tail = simd_end * BYTES_PER_PIXEL..pixels * BYTES_PER_PIXEL;
    Scalar.exact(&src[tail.clone()], &mut dst[tail], format);
}

#[target_feature(enable = "ssse3")]
unsafe fn expand(src: &[u8], dst: &mut [u8], factor: usize, format: ScanoutFormat) {
    let pixels = (src.len() / BYTES_PER_PIXEL).min(dst.len() / (BYTES_PER_PIXEL * factor));
    let simd_end = pixels - pixels % BATCH;

    // Every four source pixels produce `factor` registers of four output pixels.
    let mut masks = [_mm_loadu_si128([ZERO; 16].as_ptr() as *const __m128i); 4];
    for (register, mask_register) in masks.iter_mut().enumerate().take(factor) {
        let first = register * 4;
        let sources = [first / factor, (first + 1) / factor, (first + 2) / factor, (first + 3) / factor];
        let mask = mask(format, sources);
        *mask_register = _mm_loadu_si128(mask.as_ptr() as *const __m128i);
    }

    let mut x = 0;
    while x < simd_end {
        for first in [x, x + 4] {
            let pixels = _mm_loadu_si128(src.as_ptr().add(first * BYTES_PER_PIXEL) as *const __m128i);
            for (register, mask) in masks.iter().enumerate().take(factor) {
                let offset = (first * factor + register * 4) * BYTES_PER_PIXEL;
                let out = dst.as_mut_ptr().add(offset) as *mut __m128i;
                _mm_storeu_si128(out, _mm_shuffle_epi8(pixels, *mask));
            }
        }
        x += BATCH;
    }

    let src_tail = simd_end * BYTES_PER_PIXEL..pixels * BYTES_PER_PIXEL;
    let dst_tail = simd_end * BYTES_PER_PIXEL * factor..pixels * BYTES_PER_PIXEL * factor;
    Scalar.expand(&src[src_tail], &mut dst[dst_tail], factor, format);
}
