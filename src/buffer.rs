//! Scanout buffer allocation.

use std::io;

use tracing::{debug, info, warn};

use crate::capability::Capabilities;
use crate::error::{Error, Result};
use crate::kms::{DumbAllocation, KmsDevice, Registration, ScanoutMemory};
use crate::pixels::{ScanoutFormat, Surface};

/// Kernel-backed pixel surface registered for scanout.
#[derive(Debug)]
pub struct ScanoutBuffer {
    allocation: DumbAllocation,
    framebuffer: u32,
    registration: Registration,
    width: u32,
    height: u32,
    destroyed: bool,
}

impl ScanoutBuffer {
    /// Create and register a new buffer.
    ///
    /// Framebuffer registration tries the legacy call first, unless it is
    /// known to be unsupported, followed by the `XR24` and `XB24` formats.
    /// Nothing is leaked on failure.
    pub fn allocate<D: KmsDevice>(
        device: &D,
        width: u32,
        height: u32,
        capabilities: &mut Capabilities,
    ) -> Result<Self> {
        let allocation_error = |source| Error::Allocation { width, height, source };

        let allocation = device.create_dumb(width, height).map_err(allocation_error)?;

        let (framebuffer, registration) =
            match register(device, &allocation, width, height, capabilities) {
                Ok(registered) => registered,
                Err(err) => {
                    release_dumb(device, allocation.handle);
                    return Err(allocation_error(err));
                },
            };

        debug!(
            "allocated {width}x{height} scanout buffer (fb {framebuffer}, pitch {}, {:?})",
            allocation.pitch, registration,
        );

        Ok(Self { allocation, framebuffer, registration, width, height, destroyed: false })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> u32 {
        self.allocation.pitch
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.allocation.size
    }

    /// Kernel dumb buffer handle.
    pub fn handle(&self) -> u32 {
        self.allocation.handle
    }

    /// Registered framebuffer id.
    pub fn framebuffer(&self) -> u32 {
        self.framebuffer
    }

    pub fn registration(&self) -> Registration {
        self.registration
    }

    /// Destination byte order.
    pub fn format(&self) -> ScanoutFormat {
        self.registration.format()
    }

    /// Run `f` on a CPU mapping of the buffer.
    ///
    /// The buffer is unmapped again before this returns.
    pub fn map<D, R>(&self, device: &D, f: impl FnOnce(&mut Mapping<'_>) -> R) -> Result<R>
    where
        D: KmsDevice,
    {
        let (width, height) = (self.width, self.height);
        let (stride, format) = (self.stride(), self.format());
        let result = device.map_dumb(&self.allocation, |memory| {
            f(&mut Mapping { memory, width, height, stride, format })
        });
        Ok(result?)
    }

    /// Zero every byte of the buffer.
    pub fn clear<D: KmsDevice>(&self, device: &D) -> Result<()> {
        self.map(device, |mapping| mapping.memory.bytes().fill(0))
    }

    /// Deregister and free the buffer.
    ///
    /// Calling this more than once has no effect.
    pub fn destroy<D: KmsDevice>(&mut self, device: &D) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        release_framebuffer(device, self.framebuffer);
        release_dumb(device, self.allocation.handle);
    }
}

/// CPU view of a mapped scanout buffer.
pub struct Mapping<'a> {
    memory: &'a mut dyn ScanoutMemory,
    width: u32,
    height: u32,
    stride: u32,
    format: ScanoutFormat,
}

impl Mapping<'_> {
    /// Pixel surface covering the buffer's visible area.
    pub fn surface(&mut self) -> Surface<'_> {
        Surface::new(self.memory.bytes(), self.width, self.height, self.stride, self.format)
    }

    /// Flush CPU writes to the scanout memory.
    pub fn flush(&mut self) -> io::Result<()> {
        self.memory.flush()
    }
}

/// Register a dumb buffer as framebuffer.
fn register<D: KmsDevice>(
    device: &D,
    allocation: &DumbAllocation,
    width: u32,
    height: u32,
    capabilities: &mut Capabilities,
) -> io::Result<(u32, Registration)> {
    if capabilities.legacy_framebuffer.usable() {
        let result = device.add_framebuffer(allocation, width, height, Registration::Legacy);
        capabilities.legacy_framebuffer.resolve("legacy framebuffer registration", &result);
        if let Ok(framebuffer) = result {
            return Ok((framebuffer, Registration::Legacy));
        }
    }

    let xrgb = Registration::Extended(ScanoutFormat::Xrgb8888);
    match device.add_framebuffer(allocation, width, height, xrgb) {
        Ok(framebuffer) => return Ok((framebuffer, xrgb)),
        Err(err) => debug!("XR24 framebuffer registration failed: {err}"),
    }

    let xbgr = Registration::Extended(ScanoutFormat::Xbgr8888);
    let framebuffer = device.add_framebuffer(allocation, width, height, xbgr)?;
    Ok((framebuffer, xbgr))
}

fn release_framebuffer<D: KmsDevice>(device: &D, framebuffer: u32) {
    if let Err(err) = device.remove_framebuffer(framebuffer) {
        warn!("failed to remove framebuffer {framebuffer}: {err}");
    }
}

fn release_dumb<D: KmsDevice>(device: &D, handle: u32) {
    if let Err(err) = device.destroy_dumb(handle) {
        warn!("failed to destroy dumb buffer {handle}: {err}");
    }
}

/// Double-buffered scanout targets.
///
/// Both buffers always share the display's native resolution. The pool also
/// owns the buffer used for the initial mode-set, which is kept alive for the
/// entire session.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Option<[ScanoutBuffer; 2]>,
    mode_buffer: Option<ScanoutBuffer>,
    source_size: Option<(u32, u32)>,
    native_size: (u32, u32),
    index: usize,
}

impl BufferPool {
    pub fn new(native_width: u32, native_height: u32) -> Self {
        Self {
            native_size: (native_width, native_height),
            mode_buffer: None,
            source_size: None,
            buffers: None,
            index: 0,
        }
    }

    /// Display resolution all buffers are allocated at.
    pub fn native_size(&self) -> (u32, u32) {
        self.native_size
    }

    /// Source resolution the pool was last sized for.
    pub fn source_size(&self) -> Option<(u32, u32)> {
        self.source_size
    }

    /// Check if a source of this size requires reallocation.
    pub fn needs_resize(&self, width: u32, height: u32) -> bool {
        self.buffers.is_none() || self.source_size != Some((width, height))
    }

    /// Current back buffer index.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn back_buffer(&self) -> Option<&ScanoutBuffer> {
        self.buffers.as_ref().map(|buffers| &buffers[self.index])
    }

    /// Both double-buffered members, if allocated.
    pub fn buffers(&self) -> Option<&[ScanoutBuffer; 2]> {
        self.buffers.as_ref()
    }

    /// Make the current back buffer the front buffer.
    pub fn swap(&mut self) {
        self.index ^= 1;
    }

    pub fn mode_buffer(&self) -> Option<&ScanoutBuffer> {
        self.mode_buffer.as_ref()
    }

    /// Allocate and clear the buffer used for the initial mode-set.
    pub fn reserve_mode_buffer<D: KmsDevice>(
        &mut self,
        device: &D,
        capabilities: &mut Capabilities,
    ) -> Result<&ScanoutBuffer> {
        if let Some(mut buffer) = self.mode_buffer.take() {
            buffer.destroy(device);
        }

        let (width, height) = self.native_size;
        let mut buffer = ScanoutBuffer::allocate(device, width, height, capabilities)?;
        if let Err(err) = buffer.clear(device) {
            buffer.destroy(device);
            return Err(err);
        }

        Ok(self.mode_buffer.insert(buffer))
    }

    /// Reallocate both members for a new source resolution.
    ///
    /// On failure the pool is left without buffers.
    pub fn resize<D: KmsDevice>(
        &mut self,
        device: &D,
        source_width: u32,
        source_height: u32,
        capabilities: &mut Capabilities,
    ) -> Result<()> {
        self.release(device);

        let (width, height) = self.native_size;
        let first = ScanoutBuffer::allocate(device, width, height, capabilities)?;
        let second = match ScanoutBuffer::allocate(device, width, height, capabilities) {
            Ok(second) => second,
            Err(err) => {
                let mut first = first;
                first.destroy(device);
                return Err(err);
            },
        };

        info!("scanout buffers sized for {source_width}x{source_height} source at {width}x{height}");

        self.buffers = Some([first, second]);
        self.source_size = Some((source_width, source_height));
        self.index = 0;

        Ok(())
    }

    /// Destroy both double-buffered members.
    pub fn release<D: KmsDevice>(&mut self, device: &D) {
        if let Some(buffers) = &mut self.buffers {
            for buffer in buffers {
                buffer.destroy(device);
            }
        }

        self.buffers = None;
        self.source_size = None;
        self.index = 0;
    }

    /// Destroy every buffer, including the mode-set buffer.
    pub fn destroy<D: KmsDevice>(&mut self, device: &D) {
        self.release(device);

        if let Some(mut buffer) = self.mode_buffer.take() {
            buffer.destroy(device);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::Capability;
    use crate::kms::mock::{Call, MockDevice};

    fn allocate(device: &MockDevice, caps: &mut Capabilities) -> Result<ScanoutBuffer> {
        ScanoutBuffer::allocate(device, 1000, 600, caps)
    }

    #[test]
    fn stride_covers_width() {
        let device = MockDevice::new();
        let mut caps = Capabilities::default();
        let buffer = allocate(&device, &mut caps).unwrap();

        assert!(buffer.stride() >= buffer.width() * 4);
        assert_eq!(buffer.stride(), 1024 * 4);
        assert_eq!(buffer.size(), 1024 * 4 * 600);
        assert_eq!(buffer.registration(), Registration::Legacy);
        assert_eq!(caps.legacy_framebuffer, Capability::Supported);

        let size = buffer.map(&device, |mapping| {
            let surface = mapping.surface();
            (surface.width(), surface.height())
        });
        assert_eq!(size.unwrap(), (1000, 600));
    }

    #[test]
    fn registration_chain() {
        let device = MockDevice::new();
        device.script(|state| {
            state.legacy_framebuffer_fails = true;
            state.rejected_formats.insert(ScanoutFormat::Xrgb8888);
        });

        let mut caps = Capabilities::default();
        let buffer = allocate(&device, &mut caps).unwrap();
        assert_eq!(buffer.format(), ScanoutFormat::Xbgr8888);
        assert_eq!(caps.legacy_framebuffer, Capability::Unsupported);

        // Legacy registration is never retried once unsupported.
        device.clear_calls();
        allocate(&device, &mut caps).unwrap();
        let legacy = device.count(|call| {
            matches!(call, Call::AddFramebuffer { registration: Registration::Legacy, .. })
        });
        assert_eq!(legacy, 0);
    }

    #[test]
    fn failed_registration_releases_dumb() {
        let device = MockDevice::new();
        device.script(|state| {
            state.legacy_framebuffer_fails = true;
            state.rejected_formats.insert(ScanoutFormat::Xrgb8888);
            state.rejected_formats.insert(ScanoutFormat::Xbgr8888);
        });

        let mut caps = Capabilities::default();
        assert!(matches!(allocate(&device, &mut caps), Err(Error::Allocation { .. })));
        assert_eq!(device.count(|call| matches!(call, Call::DestroyDumb { .. })), 1);
        assert_eq!(device.count(|call| matches!(call, Call::Map { .. })), 0);
    }

    #[test]
    fn destroy_order_and_idempotence() {
        let device = MockDevice::new();
        let mut caps = Capabilities::default();
        let mut buffer = allocate(&device, &mut caps).unwrap();
        let (handle, framebuffer) = (buffer.handle(), buffer.framebuffer());

        device.clear_calls();
        buffer.destroy(&device);
        buffer.destroy(&device);

        assert_eq!(device.calls(), vec![
            Call::RemoveFramebuffer { framebuffer },
            Call::DestroyDumb { handle },
        ]);
    }

    #[test]
    fn mapped_only_on_access() {
        let device = MockDevice::new();
        let mut caps = Capabilities::default();
        let buffer = ScanoutBuffer::allocate(&device, 64, 64, &mut caps).unwrap();
        assert_eq!(device.count(|call| matches!(call, Call::Map { .. })), 0);

        let handle = buffer.handle();
        buffer
            .map(&device, |mapping| {
                mapping.surface().row_mut(1)[..4].copy_from_slice(&[1, 2, 3, 4]);
                mapping.flush().unwrap();
            })
            .unwrap();

        // Writes outlive the mapping.
        let fill = buffer.map(&device, |mapping| mapping.surface().row_mut(0)[0]).unwrap();
        assert_eq!(fill, 0xCC);

        let state = device.state.borrow();
        assert_eq!(state.calls.iter().filter(|call| **call == Call::Map { handle }).count(), 2);
        assert_eq!(state.flushes, 1);
        assert_eq!(&state.memory[&handle][256..260], &[1, 2, 3, 4]);
    }

    #[test]
    fn resize_targets_native_resolution() {
        let device = MockDevice::new();
        let mut caps = Capabilities::default();
        let mut pool = BufferPool::new(1280, 720);
        assert_eq!(pool.native_size(), (1280, 720));
        assert!(pool.needs_resize(640, 480));

        pool.resize(&device, 640, 480, &mut caps).unwrap();
        pool.swap();
        let first: Vec<u32> = pool.buffers().unwrap().iter().map(|b| b.framebuffer()).collect();

        assert_eq!(pool.source_size(), Some((640, 480)));
        assert!(!pool.needs_resize(640, 480));
        assert!(pool.needs_resize(320, 240));
        for buffer in pool.buffers().unwrap() {
            assert_eq!((buffer.width(), buffer.height()), (1280, 720));
        }

        device.clear_calls();
        pool.resize(&device, 320, 240, &mut caps).unwrap();

        assert_eq!(pool.index(), 0);
        assert_eq!(pool.source_size(), Some((320, 240)));
        for framebuffer in first {
            assert!(device.calls().contains(&Call::RemoveFramebuffer { framebuffer }));
        }
        let created = device.count(|call| *call == Call::CreateDumb { width: 1280, height: 720 });
        assert_eq!(created, 2);
    }

    #[test]
    fn failed_resize_leaves_pool_empty() {
        let device = MockDevice::new();
        let mut caps = Capabilities::default();
        let mut pool = BufferPool::new(1280, 720);
        pool.resize(&device, 640, 480, &mut caps).unwrap();

        device.script(|state| state.dumb_budget = Some(1));
        assert!(pool.resize(&device, 320, 240, &mut caps).is_err());

        assert!(pool.buffers().is_none());
        assert!(pool.back_buffer().is_none());
        assert_eq!(pool.source_size(), None);

        // The half-allocated pair was released again.
        let created = device.count(|call| matches!(call, Call::CreateDumb { .. }));
        let destroyed = device.count(|call| matches!(call, Call::DestroyDumb { .. }));
        assert_eq!(created - 1, destroyed);
    }

    #[test]
    fn mode_buffer_cleared() {
        let device = MockDevice::new();
        let mut caps = Capabilities::default();
        let mut pool = BufferPool::new(64, 32);

        let handle = pool.reserve_mode_buffer(&device, &mut caps).unwrap().handle();
        pool.destroy(&device);

        let memory = device.state.borrow().memory.get(&handle).cloned().unwrap();
        assert!(memory.iter().all(|byte| *byte == 0));
        assert!(pool.mode_buffer().is_none());
    }
}
