//! Scripted display device for tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use crate::kms::{
    ConnectorInfo, DisplayMode, DumbAllocation, EncoderInfo, KmsDevice, PlaneInfo, PlaneKind,
    Registration, ScanoutMemory,
};
use crate::pixels::ScanoutFormat;

pub const CONNECTOR: u32 = 100;
pub const ENCODER: u32 = 200;
pub const CRTC: u32 = 300;
pub const PRIMARY_PLANE: u32 = 400;
pub const OVERLAY_PLANE: u32 = 401;
pub const CURSOR_PLANE: u32 = 402;

/// Recorded kernel call.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Call {
    AcquireMaster,
    ReleaseMaster,
    CreateDumb { width: u32, height: u32 },
    AddFramebuffer { handle: u32, registration: Registration },
    Map { handle: u32 },
    RemoveFramebuffer { framebuffer: u32 },
    DestroyDumb { handle: u32 },
    Export { handle: u32 },
    SetCrtc { framebuffer: u32 },
    SetPlane { plane: u32, framebuffer: u32 },
    PageFlip { framebuffer: u32 },
    WaitVblank,
    DirtyFramebuffer { framebuffer: u32 },
}

/// Device topology and failure script.
#[derive(Debug)]
pub struct MockState {
    pub calls: Vec<Call>,
    pub connectors: Vec<ConnectorInfo<()>>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<u32>,
    pub planes: Vec<PlaneInfo>,

    /// Results of upcoming page flips, success once exhausted.
    pub flip_results: VecDeque<i32>,
    /// Results of upcoming plane updates, success once exhausted.
    pub plane_results: VecDeque<i32>,
    pub legacy_framebuffer_fails: bool,
    pub rejected_formats: HashSet<ScanoutFormat>,
    pub dirty_unsupported: bool,
    pub set_crtc_fails: bool,
    pub export_fails: bool,
    pub vblank_fails: bool,
    /// Dumb buffer creations succeeding before all further ones fail.
    pub dumb_budget: Option<usize>,

    /// Contents of every buffer mapped so far, by handle.
    pub memory: HashMap<u32, Vec<u8>>,
    pub flushes: usize,

    next_id: u32,
}

impl Default for MockState {
    fn default() -> Self {
        let mode = DisplayMode { width: 1280, height: 720, refresh: 60, preferred: true, descriptor: () };
        let connector = ConnectorInfo {
            id: CONNECTOR,
            connected: true,
            modes: vec![mode],
            current_encoder: Some(ENCODER),
            encoders: vec![ENCODER],
        };

        let encoder = EncoderInfo { id: ENCODER, crtc: Some(CRTC), possible_crtcs: 0b01 };

        let plane = |id, kind| PlaneInfo { id, kind, possible_crtcs: 0b01 };
        let planes = vec![
            plane(CURSOR_PLANE, PlaneKind::Cursor),
            plane(OVERLAY_PLANE, PlaneKind::Overlay),
            plane(PRIMARY_PLANE, PlaneKind::Primary),
        ];

        Self {
            planes,
            connectors: vec![connector],
            encoders: vec![encoder],
            crtcs: vec![CRTC, CRTC + 1],
            flip_results: Default::default(),
            plane_results: Default::default(),
            legacy_framebuffer_fails: Default::default(),
            rejected_formats: Default::default(),
            dirty_unsupported: Default::default(),
            set_crtc_fails: Default::default(),
            export_fails: Default::default(),
            vblank_fails: Default::default(),
            dumb_budget: Default::default(),
            memory: Default::default(),
            flushes: Default::default(),
            calls: Default::default(),
            next_id: 1,
        }
    }
}

impl MockState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Display device recording every call.
///
/// Clones share the same state, so tests can inspect a device after moving
/// it into a session.
#[derive(Clone, Default, Debug)]
pub struct MockDevice {
    pub state: Rc<RefCell<MockState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modify the device's script.
    pub fn script(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.borrow_mut());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Number of recorded calls matching a predicate.
    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|call| f(call)).count()
    }

    /// Framebuffers passed to page flips, in order.
    pub fn flipped(&self) -> Vec<u32> {
        let calls = self.calls();
        calls
            .iter()
            .filter_map(|call| match call {
                Call::PageFlip { framebuffer } => Some(*framebuffer),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }
}

fn failure(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

impl KmsDevice for MockDevice {
    type Mode = ();

    fn acquire_master(&self) -> io::Result<()> {
        self.record(Call::AcquireMaster);
        Ok(())
    }

    fn release_master(&self) -> io::Result<()> {
        self.record(Call::ReleaseMaster);
        Ok(())
    }

    fn enable_universal_planes(&self) -> io::Result<()> {
        Ok(())
    }

    fn connectors(&self) -> io::Result<Vec<ConnectorInfo<()>>> {
        Ok(self.state.borrow().connectors.clone())
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        let state = self.state.borrow();
        state.encoders.iter().find(|encoder| encoder.id == id).copied().ok_or_else(|| failure(libc::ENOENT))
    }

    fn crtcs(&self) -> io::Result<Vec<u32>> {
        Ok(self.state.borrow().crtcs.clone())
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        Ok(self.state.borrow().planes.clone())
    }

    fn create_dumb(&self, width: u32, height: u32) -> io::Result<DumbAllocation> {
        self.record(Call::CreateDumb { width, height });

        let mut state = self.state.borrow_mut();
        match &mut state.dumb_budget {
            Some(0) => return Err(failure(libc::ENOMEM)),
            Some(budget) => *budget -= 1,
            None => (),
        }

        // Pad rows to a multiple of 64 pixels.
        let pitch = width.div_ceil(64) * 64 * 4;
        let handle = state.next_id();
        Ok(DumbAllocation { handle, pitch, size: pitch as usize * height as usize })
    }

    fn add_framebuffer(
        &self,
        buffer: &DumbAllocation,
        _width: u32,
        _height: u32,
        registration: Registration,
    ) -> io::Result<u32> {
        self.record(Call::AddFramebuffer { handle: buffer.handle, registration });

        let mut state = self.state.borrow_mut();
        let rejected = match registration {
            Registration::Legacy => state.legacy_framebuffer_fails,
            Registration::Extended(format) => state.rejected_formats.contains(&format),
        };

        if rejected {
            Err(failure(libc::EINVAL))
        } else {
            Ok(state.next_id() + 1000)
        }
    }

    fn map_dumb<R>(
        &self,
        buffer: &DumbAllocation,
        f: impl FnOnce(&mut dyn ScanoutMemory) -> R,
    ) -> io::Result<R> {
        self.record(Call::Map { handle: buffer.handle });

        // Contents survive unmapping, like kernel memory.
        let data = self.state.borrow_mut().memory.remove(&buffer.handle);
        let data = data.unwrap_or_else(|| vec![0xCC; buffer.size]);

        let mut mapping = MockMapping { data, flushes: 0 };
        let result = f(&mut mapping);

        let mut state = self.state.borrow_mut();
        state.flushes += mapping.flushes;
        state.memory.insert(buffer.handle, mapping.data);

        Ok(result)
    }

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        self.record(Call::RemoveFramebuffer { framebuffer });
        Ok(())
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        self.record(Call::DestroyDumb { handle });
        Ok(())
    }

    fn export_dumb(&self, handle: u32) -> io::Result<OwnedFd> {
        self.record(Call::Export { handle });

        if self.state.borrow().export_fails {
            return Err(failure(libc::ENOSYS));
        }

        Ok(File::open("/dev/null")?.into())
    }

    fn set_crtc(
        &self,
        _crtc: u32,
        framebuffer: u32,
        _connector: u32,
        _mode: &DisplayMode<()>,
    ) -> io::Result<()> {
        self.record(Call::SetCrtc { framebuffer });

        if self.state.borrow().set_crtc_fails {
            Err(failure(libc::EINVAL))
        } else {
            Ok(())
        }
    }

    fn set_plane(
        &self,
        plane: u32,
        _crtc: u32,
        framebuffer: u32,
        _width: u32,
        _height: u32,
    ) -> io::Result<()> {
        self.record(Call::SetPlane { plane, framebuffer });

        match self.state.borrow_mut().plane_results.pop_front() {
            Some(errno) if errno != 0 => Err(failure(errno)),
            _ => Ok(()),
        }
    }

    fn page_flip(&self, _crtc: u32, framebuffer: u32) -> io::Result<()> {
        self.record(Call::PageFlip { framebuffer });

        match self.state.borrow_mut().flip_results.pop_front() {
            Some(errno) if errno != 0 => Err(failure(errno)),
            _ => Ok(()),
        }
    }

    fn wait_vblank(&self, _crtc_index: u32) -> io::Result<()> {
        self.record(Call::WaitVblank);

        if self.state.borrow().vblank_fails {
            Err(failure(libc::EINVAL))
        } else {
            Ok(())
        }
    }

    fn dirty_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        self.record(Call::DirtyFramebuffer { framebuffer });

        if self.state.borrow().dirty_unsupported {
            Err(failure(libc::ENOSYS))
        } else {
            Ok(())
        }
    }
}

/// Heap-backed stand-in for a dumb buffer mapping.
#[derive(Debug)]
struct MockMapping {
    data: Vec<u8>,
    flushes: usize,
}

impl ScanoutMemory for MockMapping {
    fn bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
