//! DRM device node backend.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use smithay::backend::drm::DrmDeviceFd;
use smithay::backend::udev;
use smithay::reexports::drm::buffer::{self, Buffer, DrmFourcc, DrmModifier, PlanarBuffer};
use smithay::reexports::drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use smithay::reexports::drm::control::{
    self, connector, crtc, encoder, framebuffer, plane, CrtcListFilter, Device as ControlDevice,
    FbCmd2Flags, ModeTypeFlags, PageFlipFlags, ResourceHandle,
};
use smithay::reexports::drm::{ClientCapability, Device, VblankWaitFlags, VblankWaitTarget};
use smithay::utils::DeviceFd;
use tracing::debug;

use crate::kms::{
    ConnectorInfo, DisplayMode, DumbAllocation, EncoderInfo, KmsDevice, PlaneInfo, PlaneKind,
    Registration, ScanoutMemory,
};
use crate::pixels::ScanoutFormat;

/// Device used when udev cannot name a primary GPU.
pub const DEFAULT_DEVICE: &str = "/dev/dri/card0";

/// Seat used for primary GPU lookup.
const SEAT: &str = "seat0";

/// Opened DRM device node.
pub struct Card {
    dumb_buffers: RefCell<HashMap<u32, DumbBuffer>>,
    fd: DrmDeviceFd,
    path: PathBuf,
}

impl Card {
    /// Open a DRM device node.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(&path)?;
        let fd = DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(file)));

        debug!("opened DRM device {path:?}");

        Ok(Self { fd, path, dumb_buffers: Default::default() })
    }

    /// Path of the primary GPU's device node.
    pub fn primary_path() -> PathBuf {
        match udev::primary_gpu(SEAT) {
            Ok(Some(path)) => path,
            Ok(None) => PathBuf::from(DEFAULT_DEVICE),
            Err(err) => {
                debug!("udev GPU lookup failed: {err}");
                PathBuf::from(DEFAULT_DEVICE)
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a DRM object's property value by name.
    fn property_value<T: ResourceHandle>(&self, object: T, name: &str) -> Option<u64> {
        // Get all available properties.
        let properties = self.fd.get_properties(object).ok()?;
        let (property_handles, values) = properties.as_props_and_values();

        // Find property matching the requested name.
        property_handles.iter().zip(values).find_map(|(handle, value)| {
            let property_info = self.fd.get_property(*handle).ok()?;
            let property_name = property_info.name().to_str().ok()?;

            (property_name == name).then_some(*value)
        })
    }

    /// Convert a CRTC filter into a bitmask of CRTC indices.
    fn crtc_mask(&self, filter: CrtcListFilter) -> io::Result<u32> {
        let resources = self.fd.resource_handles()?;
        let compatible = resources.filter_crtcs(filter);

        let mask = resources
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| compatible.contains(*crtc))
            .fold(0, |mask, (index, _)| mask | (1 << index));

        Ok(mask)
    }

    /// Run a closure with the dumb buffer for a GEM handle.
    fn with_dumb<T>(&self, handle: u32, f: impl FnOnce(&DumbBuffer) -> T) -> io::Result<T> {
        let dumb_buffers = self.dumb_buffers.borrow();
        dumb_buffers.get(&handle).map(f).ok_or_else(|| unknown_object("dumb buffer", handle))
    }
}

impl KmsDevice for Card {
    type Mode = control::Mode;

    fn acquire_master(&self) -> io::Result<()> {
        self.fd.acquire_master_lock()
    }

    fn release_master(&self) -> io::Result<()> {
        self.fd.release_master_lock()
    }

    fn enable_universal_planes(&self) -> io::Result<()> {
        self.fd.set_client_capability(ClientCapability::UniversalPlanes, true)
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo<Self::Mode>>> {
        let resources = self.fd.resource_handles()?;

        let mut connectors = Vec::with_capacity(resources.connectors().len());
        for handle in resources.connectors() {
            let connector = match self.fd.get_connector(*handle, true) {
                Ok(connector) => connector,
                Err(err) => {
                    debug!("skipping connector {}: {err}", u32::from(*handle));
                    continue;
                },
            };

            let modes = connector
                .modes()
                .iter()
                .map(|mode| {
                    let (width, height) = mode.size();
                    DisplayMode {
                        width: width.into(),
                        height: height.into(),
                        refresh: mode.vrefresh(),
                        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
                        descriptor: *mode,
                    }
                })
                .collect();

            connectors.push(ConnectorInfo {
                modes,
                id: connector.handle().into(),
                connected: connector.state() == connector::State::Connected,
                current_encoder: connector.current_encoder().map(u32::from),
                encoders: connector.encoders().iter().map(|encoder| u32::from(*encoder)).collect(),
            });
        }

        Ok(connectors)
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        let handle: encoder::Handle = typed_handle("encoder", id)?;
        let encoder = self.fd.get_encoder(handle)?;

        Ok(EncoderInfo {
            id,
            crtc: encoder.crtc().map(u32::from),
            possible_crtcs: self.crtc_mask(encoder.possible_crtcs())?,
        })
    }

    fn crtcs(&self) -> io::Result<Vec<u32>> {
        let resources = self.fd.resource_handles()?;
        Ok(resources.crtcs().iter().map(|crtc| u32::from(*crtc)).collect())
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        let mut planes = Vec::new();
        for handle in self.fd.plane_handles()? {
            let plane = match self.fd.get_plane(handle) {
                Ok(plane) => plane,
                Err(_) => continue,
            };

            // Planes without a known type are never used for scanout.
            let kind = match self.property_value(handle, "type").and_then(PlaneKind::from_raw) {
                Some(kind) => kind,
                None => continue,
            };

            planes.push(PlaneInfo {
                kind,
                id: handle.into(),
                possible_crtcs: self.crtc_mask(plane.possible_crtcs())?,
            });
        }

        Ok(planes)
    }

    fn create_dumb(&self, width: u32, height: u32) -> io::Result<DumbAllocation> {
        let buffer = self.fd.create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)?;

        let pitch = Buffer::pitch(&buffer);
        let allocation = DumbAllocation {
            pitch,
            handle: Buffer::handle(&buffer).into(),
            size: pitch as usize * height as usize,
        };
        self.dumb_buffers.borrow_mut().insert(allocation.handle, buffer);

        Ok(allocation)
    }

    fn add_framebuffer(
        &self,
        buffer: &DumbAllocation,
        _width: u32,
        _height: u32,
        registration: Registration,
    ) -> io::Result<u32> {
        let dumb_buffers = self.dumb_buffers.borrow();
        let dumb = dumb_buffers
            .get(&buffer.handle)
            .ok_or_else(|| unknown_object("dumb buffer", buffer.handle))?;

        let framebuffer = match registration {
            Registration::Legacy => self.fd.add_framebuffer(dumb, 24, 32)?,
            Registration::Extended(format) => {
                let planar = FormattedBuffer { buffer: dumb, format: fourcc(format) };
                self.fd.add_planar_framebuffer(&planar, FbCmd2Flags::empty())?
            },
        };

        Ok(framebuffer.into())
    }

    fn map_dumb<R>(
        &self,
        buffer: &DumbAllocation,
        f: impl FnOnce(&mut dyn ScanoutMemory) -> R,
    ) -> io::Result<R> {
        let mut dumb_buffers = self.dumb_buffers.borrow_mut();
        let dumb = dumb_buffers
            .get_mut(&buffer.handle)
            .ok_or_else(|| unknown_object("dumb buffer", buffer.handle))?;

        let mut mapping = self.fd.map_dumb_buffer(dumb)?;
        Ok(f(&mut mapping))
    }

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        let handle: framebuffer::Handle = typed_handle("framebuffer", framebuffer)?;
        self.fd.destroy_framebuffer(handle)
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        let buffer = self.dumb_buffers.borrow_mut().remove(&handle);
        match buffer {
            Some(buffer) => self.fd.destroy_dumb_buffer(buffer),
            None => Err(unknown_object("dumb buffer", handle)),
        }
    }

    fn export_dumb(&self, handle: u32) -> io::Result<OwnedFd> {
        let buffer_handle = self.with_dumb(handle, |buffer| Buffer::handle(buffer))?;
        let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
        self.fd.buffer_to_prime_fd(buffer_handle, flags)
    }

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: u32,
        connector: u32,
        mode: &DisplayMode<Self::Mode>,
    ) -> io::Result<()> {
        let crtc: crtc::Handle = typed_handle("crtc", crtc)?;
        let framebuffer: framebuffer::Handle = typed_handle("framebuffer", framebuffer)?;
        let connector: connector::Handle = typed_handle("connector", connector)?;

        self.fd.set_crtc(crtc, Some(framebuffer), (0, 0), &[connector], Some(mode.descriptor))
    }

    fn set_plane(
        &self,
        plane: u32,
        crtc: u32,
        framebuffer: u32,
        width: u32,
        height: u32,
    ) -> io::Result<()> {
        let plane: plane::Handle = typed_handle("plane", plane)?;
        let crtc: crtc::Handle = typed_handle("crtc", crtc)?;
        let framebuffer: framebuffer::Handle = typed_handle("framebuffer", framebuffer)?;

        // Source rectangle is in 16.16 fixed point.
        let crtc_rect = (0, 0, width, height);
        let src_rect = (0, 0, width << 16, height << 16);
        self.fd.set_plane(plane, crtc, Some(framebuffer), 0, crtc_rect, src_rect)
    }

    fn page_flip(&self, crtc: u32, framebuffer: u32) -> io::Result<()> {
        let crtc: crtc::Handle = typed_handle("crtc", crtc)?;
        let framebuffer: framebuffer::Handle = typed_handle("framebuffer", framebuffer)?;

        self.fd.page_flip(crtc, framebuffer, PageFlipFlags::empty(), None)
    }

    fn wait_vblank(&self, crtc_index: u32) -> io::Result<()> {
        let target = VblankWaitTarget::Relative(1);
        self.fd.wait_vblank(target, VblankWaitFlags::empty(), crtc_index, 0).map(drop)
    }

    fn dirty_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        let framebuffer: framebuffer::Handle = typed_handle("framebuffer", framebuffer)?;
        self.fd.dirty_framebuffer(framebuffer, &[])
    }
}

/// Dumb buffer registered with a format other than its creation format.
struct FormattedBuffer<'a> {
    buffer: &'a DumbBuffer,
    format: DrmFourcc,
}

impl PlanarBuffer for FormattedBuffer<'_> {
    fn size(&self) -> (u32, u32) {
        Buffer::size(self.buffer)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        [Buffer::pitch(self.buffer), 0, 0, 0]
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        [Some(Buffer::handle(self.buffer)), None, None, None]
    }

    fn offsets(&self) -> [u32; 4] {
        [0; 4]
    }
}

impl ScanoutMemory for DumbMapping<'_> {
    fn bytes(&mut self) -> &mut [u8] {
        &mut **self
    }

    fn flush(&mut self) -> io::Result<()> {
        // Mappings always start page-aligned.
        let result = unsafe { libc::msync(self.as_mut_ptr().cast(), self.len(), libc::MS_SYNC) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

/// DRM format token for a scanout format.
pub fn fourcc(format: ScanoutFormat) -> DrmFourcc {
    match format {
        ScanoutFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
        ScanoutFormat::Xbgr8888 => DrmFourcc::Xbgr8888,
    }
}

/// Convert a raw object id to a typed DRM handle.
fn typed_handle<T: ResourceHandle>(kind: &str, id: u32) -> io::Result<T> {
    control::from_u32(id).ok_or_else(|| unknown_object(kind, id))
}

fn unknown_object(kind: &str, id: u32) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("unknown {kind} {id}"))
}
