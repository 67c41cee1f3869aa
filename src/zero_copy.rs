//! Zero-copy scanout of GPU rendered frames.
//!
//! Scanout buffers are exported as DMA-BUFs and imported by the renderer, so
//! frames can be blitted on the GPU directly into memory the display reads
//! from. Any setup failure permanently falls back to CPU conversion.

use std::error::Error as StdError;
use std::os::fd::OwnedFd;
use std::time::Instant;

use tracing::debug;

use crate::buffer::ScanoutBuffer;
use crate::error::{Error, Result};
use crate::kms::KmsDevice;
use crate::session::PresentationSession;

/// Number of buffers shared with the GPU.
const BUFFER_COUNT: usize = 2;

/// Result type of the renderer boundary.
pub type GpuResult<T> = std::result::Result<T, Box<dyn StdError>>;

/// Scanout buffer shared through a DMA-BUF file descriptor.
#[derive(Debug)]
pub struct ExportedBuffer {
    pub fd: OwnedFd,
    /// Framebuffer to flip once the GPU finished writing.
    pub framebuffer: u32,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub stride: u32,
    /// Size in bytes.
    pub size: usize,
    /// DRM fourcc format code.
    pub fourcc: u32,
}

impl ExportedBuffer {
    pub(crate) fn export<D: KmsDevice>(device: &D, buffer: &ScanoutBuffer) -> Result<Self> {
        let fd = device
            .export_dumb(buffer.handle())
            .map_err(|err| Error::ZeroCopy(format!("PRIME export failed: {err}")))?;

        Ok(Self {
            fd,
            framebuffer: buffer.framebuffer(),
            width: buffer.width(),
            height: buffer.height(),
            stride: buffer.stride(),
            size: buffer.size(),
            fourcc: buffer.format().fourcc(),
        })
    }
}

/// CPU-readable RGBA copy of the latest rendered frame.
#[derive(Copy, Clone, Debug)]
pub struct CpuFrame<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub stride: u32,
}

/// Renderer access required for zero-copy presentation.
pub trait GpuImporter {
    /// Device image aliasing an exported buffer.
    type Image;

    /// Completion signal of a submitted blit.
    type Fence;

    /// Import an exported scanout buffer as blit target.
    fn import(&mut self, buffer: &ExportedBuffer) -> GpuResult<Self::Image>;

    /// Blit the latest rendered frame into `target` with nearest filtering.
    fn blit(&mut self, target: &Self::Image) -> GpuResult<Self::Fence>;

    /// Block until a blit has completed.
    fn wait(&mut self, fence: Self::Fence) -> GpuResult<()>;

    /// Read the latest rendered frame back into CPU memory.
    fn readback(&mut self) -> GpuResult<CpuFrame<'_>>;
}

struct Target<I> {
    image: I,
    buffer: ExportedBuffer,
}

/// Presentation through GPU blits into shared scanout buffers.
pub struct ZeroCopy<I: GpuImporter> {
    targets: Vec<Target<I::Image>>,
    index: usize,
}

impl<I: GpuImporter> Default for ZeroCopy<I> {
    fn default() -> Self {
        Self { targets: Vec::new(), index: 0 }
    }
}

impl<I: GpuImporter> ZeroCopy<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if frames are currently presented without CPU copies.
    pub fn is_active(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Present the renderer's latest frame.
    ///
    /// The shared buffers are set up on first use. Once that failed, every
    /// frame is read back and converted on the CPU instead.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn present<D: KmsDevice>(
        &mut self,
        session: &mut PresentationSession<D>,
        importer: &mut I,
    ) -> Result<()> {
        if self.targets.is_empty() && session.capabilities().zero_copy.usable() {
            self.setup(session, importer);
        }

        let Some(target) = self.targets.get(self.index) else {
            let frame = importer.readback().map_err(gpu_error)?;
            return session.present(frame.pixels, frame.width, frame.height, frame.stride);
        };

        let start = Instant::now();
        let fence = importer.blit(&target.image).map_err(gpu_error)?;
        importer.wait(fence).map_err(gpu_error)?;

        session.flip_with_timing(target.buffer.framebuffer, start.elapsed())?;
        self.index = (self.index + 1) % self.targets.len();

        Ok(())
    }

    /// Export and import all shared buffers.
    fn setup<D: KmsDevice>(&mut self, session: &mut PresentationSession<D>, importer: &mut I) {
        match Self::import(session, importer) {
            Ok(targets) => {
                session.capabilities_mut().zero_copy.resolve::<_, Error>("zero-copy scanout", &Ok(()));
                self.targets = targets;
                self.index = 0;
            },
            Err(err) => {
                session.capabilities_mut().zero_copy.disable("zero-copy scanout", err);
                session.release_exported();
            },
        }
    }

    fn import<D: KmsDevice>(
        session: &mut PresentationSession<D>,
        importer: &mut I,
    ) -> Result<Vec<Target<I::Image>>> {
        let buffers = session.export_buffers(BUFFER_COUNT)?;

        buffers
            .into_iter()
            .map(|buffer| {
                debug!(
                    "importing {}x{} buffer (stride {}, fourcc {:#010x})",
                    buffer.width, buffer.height, buffer.stride, buffer.fourcc
                );

                let image = importer
                    .import(&buffer)
                    .map_err(|err| Error::ZeroCopy(format!("GPU import failed: {err}")))?;
                Ok(Target { image, buffer })
            })
            .collect()
    }
}

fn gpu_error(err: Box<dyn StdError>) -> Error {
    Error::Gpu(err.to_string())
}
