//! Kernel mode-setting boundary.
//!
//! Everything the presentation backend needs from the display device goes
//! through [`KmsDevice`]. Object identifiers are the kernel's raw `u32` ids.

use std::fmt::Debug;
use std::io;
use std::os::fd::OwnedFd;

use crate::pixels::ScanoutFormat;

pub mod card;
#[cfg(test)]
pub mod mock;

pub use card::Card;

/// Display mode of a connector.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DisplayMode<M> {
    pub width: u32,
    pub height: u32,
    /// Vertical refresh rate in Hz.
    pub refresh: u32,
    pub preferred: bool,
    /// Kernel mode info required for mode-setting.
    pub descriptor: M,
}

/// Physical output port.
#[derive(Clone, Debug)]
pub struct ConnectorInfo<M> {
    pub id: u32,
    pub connected: bool,
    pub modes: Vec<DisplayMode<M>>,
    pub current_encoder: Option<u32>,
    pub encoders: Vec<u32>,
}

#[derive(Copy, Clone, Debug)]
pub struct EncoderInfo {
    pub id: u32,
    pub crtc: Option<u32>,
    /// Bitmask of compatible CRTC indices.
    pub possible_crtcs: u32,
}

/// Plane type, as reported by the plane's `type` property.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PlaneKind {
    Overlay,
    Primary,
    Cursor,
}

impl PlaneKind {
    /// Convert the raw `type` property value.
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Overlay),
            1 => Some(Self::Primary),
            2 => Some(Self::Cursor),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PlaneInfo {
    pub id: u32,
    pub kind: PlaneKind,
    /// Bitmask of compatible CRTC indices.
    pub possible_crtcs: u32,
}

/// Kernel dumb buffer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DumbAllocation {
    pub handle: u32,
    /// Row stride in bytes.
    pub pitch: u32,
    /// Total size in bytes.
    pub size: usize,
}

/// Framebuffer registration call.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Registration {
    /// Depth/bpp registration without explicit pixel format.
    Legacy,
    /// Registration with an explicit format token.
    Extended(ScanoutFormat),
}

impl Registration {
    /// Destination byte order produced by this registration.
    pub fn format(self) -> ScanoutFormat {
        match self {
            Self::Legacy => ScanoutFormat::Xrgb8888,
            Self::Extended(format) => format,
        }
    }
}

/// Temporary CPU mapping of a dumb buffer.
pub trait ScanoutMemory {
    /// Mapped bytes, covering the entire buffer.
    fn bytes(&mut self) -> &mut [u8];

    /// Force CPU writes out to the scanout memory.
    fn flush(&mut self) -> io::Result<()>;
}

/// Display device operations.
pub trait KmsDevice {
    /// Kernel mode descriptor.
    type Mode: Copy + Debug;

    fn acquire_master(&self) -> io::Result<()>;

    fn release_master(&self) -> io::Result<()>;

    /// Expose primary and cursor planes in plane enumeration.
    fn enable_universal_planes(&self) -> io::Result<()>;

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo<Self::Mode>>>;

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo>;

    /// All CRTC ids, in resource order.
    fn crtcs(&self) -> io::Result<Vec<u32>>;

    fn planes(&self) -> io::Result<Vec<PlaneInfo>>;

    /// Create a 32 bpp dumb buffer.
    fn create_dumb(&self, width: u32, height: u32) -> io::Result<DumbAllocation>;

    /// Register a dumb buffer as framebuffer, returning the framebuffer id.
    fn add_framebuffer(
        &self,
        buffer: &DumbAllocation,
        width: u32,
        height: u32,
        registration: Registration,
    ) -> io::Result<u32>;

    /// Map a dumb buffer into CPU memory while `f` runs.
    fn map_dumb<R>(
        &self,
        buffer: &DumbAllocation,
        f: impl FnOnce(&mut dyn ScanoutMemory) -> R,
    ) -> io::Result<R>;

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()>;

    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;

    /// Export a dumb buffer as DMA-BUF file descriptor.
    fn export_dumb(&self, handle: u32) -> io::Result<OwnedFd>;

    /// Full mode-set of `crtc` scanning out `framebuffer`.
    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: u32,
        connector: u32,
        mode: &DisplayMode<Self::Mode>,
    ) -> io::Result<()>;

    /// Unscaled plane update covering `width`x`height` from the origin.
    fn set_plane(
        &self,
        plane: u32,
        crtc: u32,
        framebuffer: u32,
        width: u32,
        height: u32,
    ) -> io::Result<()>;

    /// Non-blocking flip at the next vblank.
    fn page_flip(&self, crtc: u32, framebuffer: u32) -> io::Result<()>;

    /// Block until the next vblank of the CRTC at `crtc_index`.
    fn wait_vblank(&self, crtc_index: u32) -> io::Result<()>;

    /// Notify the kernel the whole framebuffer was written.
    fn dirty_framebuffer(&self, framebuffer: u32) -> io::Result<()>;
}

/// Check if a kernel error means a previous flip is still pending.
pub fn is_busy(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::EBUSY)
}
