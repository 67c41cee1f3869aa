//! Pixel conversion pipeline.
//!
//! Converts RGBA source frames into the scanout buffer's byte order while
//! resampling to the scanout resolution with fixed-point nearest-neighbor
//! sampling. The destination's fourth byte is always written as zero.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[cfg(target_arch = "aarch64")]
mod neon;
pub mod pattern;
pub mod scalar;
#[cfg(target_arch = "x86_64")]
mod ssse3;

pub use scalar::Scalar;

/// Bytes per pixel for both source and destination.
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest factor handled by the uniform integer scaling path.
const MAX_UNIFORM_FACTOR: u32 = 4;

/// Byte order of a scanout buffer.
#[derive(Deserialize, Serialize, Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ScanoutFormat {
    /// Bytes `[B, G, R, 0]`.
    Xrgb8888,
    /// Bytes `[R, G, B, 0]`.
    Xbgr8888,
}

impl ScanoutFormat {
    /// Source channel index for each of the first three destination bytes.
    #[inline]
    pub const fn source_channels(self) -> [usize; 3] {
        match self {
            Self::Xrgb8888 => [2, 1, 0],
            Self::Xbgr8888 => [0, 1, 2],
        }
    }

    /// DRM fourcc format code.
    pub const fn fourcc(self) -> u32 {
        match self {
            Self::Xrgb8888 => u32::from_le_bytes(*b"XR24"),
            Self::Xbgr8888 => u32::from_le_bytes(*b"XB24"),
        }
    }

    /// Convert one RGBA pixel.
    #[inline]
    pub fn convert(self, rgba: &[u8]) -> [u8; 4] {
        let [c0, c1, c2] = self.source_channels();
        [rgba[c0], rgba[c1], rgba[c2], 0]
    }

    /// Encode a color.
    #[inline]
    pub fn encode(self, r: u8, g: u8, b: u8) -> [u8; 4] {
        self.convert(&[r, g, b, 0])
    }
}

/// CPU-readable RGBA frame.
#[derive(Copy, Clone, Debug)]
pub struct SourceFrame<'a> {
    pixels: &'a [u8],
    width: u32,
    height: u32,
    stride: u32,
}

impl<'a> SourceFrame<'a> {
    /// Validate a source frame.
    ///
    /// The stride must cover a full row and the buffer must contain every
    /// row, except that the last row does not need to be padded.
    pub fn new(pixels: &'a [u8], width: u32, height: u32, stride: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidSource(format!("empty frame {width}x{height}")));
        }

        let required = width.checked_mul(BYTES_PER_PIXEL as u32);
        match required {
            Some(required) if stride >= required => (),
            _ => {
                let required = required.unwrap_or(u32::MAX);
                return Err(Error::InvalidStride { stride, width, required });
            },
        }

        let len = stride as usize * (height as usize - 1) + width as usize * BYTES_PER_PIXEL;
        if pixels.len() < len {
            return Err(Error::InvalidSource(format!(
                "buffer holds {} bytes, {width}x{height} with stride {stride} needs {len}",
                pixels.len()
            )));
        }

        Ok(Self { pixels, width, height, stride })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixels of a row, without padding.
    #[inline]
    fn row(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.stride as usize;
        &self.pixels[start..start + self.width as usize * BYTES_PER_PIXEL]
    }
}

/// CPU-writable destination buffer.
#[derive(Debug)]
pub struct Surface<'a> {
    pixels: &'a mut [u8],
    width: u32,
    height: u32,
    stride: u32,
    format: ScanoutFormat,
}

impl<'a> Surface<'a> {
    pub fn new(
        pixels: &'a mut [u8],
        width: u32,
        height: u32,
        stride: u32,
        format: ScanoutFormat,
    ) -> Self {
        debug_assert!(stride as usize >= width as usize * BYTES_PER_PIXEL);
        debug_assert!(pixels.len() >= stride as usize * height as usize);

        Self { pixels, width, height, stride, format }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> ScanoutFormat {
        self.format
    }

    /// Pixels of a row, without padding.
    #[inline]
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        &mut self.pixels[start..start + self.width as usize * BYTES_PER_PIXEL]
    }

    /// Copy the pixels of row `src` to row `dst`.
    #[inline]
    fn copy_row(&mut self, src: u32, dst: u32) {
        let len = self.width as usize * BYTES_PER_PIXEL;
        let start = src as usize * self.stride as usize;
        self.pixels.copy_within(start..start + len, dst as usize * self.stride as usize);
    }
}

/// Horizontal resampling strategy for a pair of row widths.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HorizontalPath {
    Exact,
    Expand(usize),
    Generic,
}

impl HorizontalPath {
    pub fn new(src_width: u32, dst_width: u32) -> Self {
        if src_width == dst_width {
            Self::Exact
        } else if dst_width == src_width * 2 {
            Self::Expand(2)
        } else if dst_width == src_width * 4 {
            Self::Expand(4)
        } else {
            Self::Generic
        }
    }
}

impl Display for HorizontalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "1:1"),
            Self::Expand(factor) => write!(f, "{factor}x"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Row conversion strategy.
///
/// All implementations must produce output identical to [`Scalar`].
pub trait Kernel {
    /// Convert a row of equal source and destination width.
    fn exact(&self, src: &[u8], dst: &mut [u8], format: ScanoutFormat);

    /// Convert a row, repeating every source pixel `factor` times.
    fn expand(&self, src: &[u8], dst: &mut [u8], factor: usize, format: ScanoutFormat);

    /// Convert a row with nearest-neighbor sampling to the destination width.
    fn resample(&self, src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
        scalar::resample(src, dst, format);
    }

    /// Convert a row using the path chosen for its width ratio.
    #[inline]
    fn convert_row(&self, path: HorizontalPath, src: &[u8], dst: &mut [u8], format: ScanoutFormat) {
        match path {
            HorizontalPath::Exact => self.exact(src, dst, format),
            HorizontalPath::Expand(factor) => self.expand(src, dst, factor, format),
            HorizontalPath::Generic => self.resample(src, dst, format),
        }
    }
}

/// Convert and resample a source frame into a surface.
///
/// Uses the fastest row kernel supported by the CPU.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn blit(src: &SourceFrame<'_>, dst: &mut Surface<'_>) {
    #[cfg(target_arch = "aarch64")]
    {
        blit_with(&neon::Neon, src, dst)
    }

    #[cfg(target_arch = "x86_64")]
    {
        match ssse3::Ssse3::detect() {
            Some(kernel) => blit_with(&kernel, src, dst),
            None => blit_with(&Scalar, src, dst),
        }
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        blit_with(&Scalar, src, dst)
    }
}

/// Convert and resample a source frame into a surface with a specific kernel.
pub fn blit_with<K: Kernel>(kernel: &K, src: &SourceFrame<'_>, dst: &mut Surface<'_>) {
    let path = HorizontalPath::new(src.width, dst.width);
    let format = dst.format;

    // Convert each source row once when both axes share an integer factor.
    if let Some(factor) = uniform_factor(src, dst) {
        for src_y in 0..src.height {
            let dst_y = src_y * factor;
            kernel.convert_row(path, src.row(src_y), dst.row_mut(dst_y), format);
            for copy in 1..factor {
                dst.copy_row(dst_y, dst_y + copy);
            }
        }
        return;
    }

    for dst_y in 0..dst.height {
        let src_y = nearest(dst_y as usize, src.height as usize, dst.height as usize);
        kernel.convert_row(path, src.row(src_y as u32), dst.row_mut(dst_y), format);
    }
}

/// Factor shared by both axes, if it is a small integer.
fn uniform_factor(src: &SourceFrame<'_>, dst: &Surface<'_>) -> Option<u32> {
    (1..=MAX_UNIFORM_FACTOR)
        .find(|factor| src.width * factor == dst.width && src.height * factor == dst.height)
}

/// Fixed-point nearest-neighbor source index for destination index `dst`.
#[inline]
pub fn nearest(dst: usize, src_len: usize, dst_len: usize) -> usize {
    let index = (dst as u64 * src_len as u64 / dst_len as u64) as usize;
    index.min(src_len - 1)
}

/// Short description of the vertical resampling direction.
pub fn vertical_direction(src_height: u32, dst_height: u32) -> &'static str {
    match src_height.cmp(&dst_height) {
        std::cmp::Ordering::Equal => "1:1",
        std::cmp::Ordering::Greater => "down",
        std::cmp::Ordering::Less => "up",
    }
}
