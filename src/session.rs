//! Frame presentation state machine.

use std::collections::HashSet;
use std::io;
use std::mem::{self, Discriminant};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, ScanoutBuffer};
use crate::capability::Capabilities;
use crate::config::Config;
use crate::discovery::{self, Discovery};
use crate::error::{Error, Result};
use crate::kms::{self, KmsDevice};
use crate::perf::{ClockSource, FrameTiming, PerfWindow};
use crate::pixels::{self, pattern, HorizontalPath, SourceFrame};
use crate::zero_copy::ExportedBuffer;

/// Session lifecycle.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    /// Created, but no output has been set up yet.
    Uninitialized,
    /// Output is configured, no frame has been shown yet.
    ModeEstablished,
    /// Frames are submitted through page flips or their fallbacks.
    Presenting,
    /// All resources are released.
    Closed,
}

/// Messages which should only be logged once.
#[derive(Default, Debug)]
struct LoggedOnce {
    /// Source size of the last logged blit path.
    blit_path: Option<(u32, u32)>,
    cache_flush: bool,
    vblank: bool,
    frame_failures: HashSet<(Discriminant<Error>, Option<i32>)>,
}

/// Presentation of frames on a single display.
pub struct PresentationSession<D: KmsDevice> {
    device: Option<D>,
    config: Config,
    capabilities: Capabilities,
    state: State,
    output: Option<Discovery<D::Mode>>,
    pool: Option<BufferPool>,
    exported: Vec<ScanoutBuffer>,
    frame_count: u64,
    perf: Option<PerfWindow>,
    logged: LoggedOnce,
}

impl<D: KmsDevice> PresentationSession<D> {
    pub fn new(device: D, config: Config) -> Self {
        let perf = config.perf_stats.then(|| PerfWindow::new(ClockSource::sysfs()));

        Self {
            config,
            perf,
            device: Some(device),
            state: State::Uninitialized,
            capabilities: Default::default(),
            exported: Default::default(),
            frame_count: Default::default(),
            logged: Default::default(),
            output: Default::default(),
            pool: Default::default(),
        }
    }

    /// Configure the display output.
    ///
    /// On failure all partially acquired resources are released and the
    /// session is closed.
    pub fn init(&mut self) -> Result<()> {
        if self.state != State::Uninitialized {
            return Err(Error::InvalidState(self.state));
        }

        match self.try_init() {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("display initialization failed: {err}");
                self.cleanup();
                Err(err)
            },
        }
    }

    fn try_init(&mut self) -> Result<()> {
        let device = self.device.as_ref().ok_or(Error::InvalidState(self.state))?;

        if let Err(err) = device.acquire_master() {
            warn!("unable to become DRM master: {err}");
        }
        if let Err(err) = device.enable_universal_planes() {
            warn!("universal planes unavailable: {err}");
        }

        let output = discovery::discover(device, self.config.prefer_overlay_plane)?;
        let (width, height) = (output.mode.width, output.mode.height);

        let pool = self.pool.insert(BufferPool::new(width, height));
        let mode_buffer = pool.reserve_mode_buffer(device, &mut self.capabilities)?;

        let framebuffer = mode_buffer.framebuffer();
        if let Err(err) = device.set_crtc(output.crtc, framebuffer, output.connector, &output.mode) {
            warn!("initial mode-set failed, assuming mode is active: {err}");
        }

        info!(
            "display ready: connector={} crtc={} plane={:?} {width}x{height}@{}",
            output.connector,
            output.crtc,
            output.plane.map(|plane| plane.id),
            output.mode.refresh,
        );

        self.output = Some(output);
        self.state = State::ModeEstablished;

        Ok(())
    }

    /// Convert an RGBA frame into the back buffer and show it.
    ///
    /// `stride` is the distance between two source rows in bytes.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn present(&mut self, pixels: &[u8], width: u32, height: u32, stride: u32) -> Result<()> {
        let start = Instant::now();

        self.ensure_active()?;
        let source = SourceFrame::new(pixels, width, height, stride)?;

        let state = self.state;
        let (Some(device), Some(pool)) = (self.device.as_ref(), self.pool.as_mut()) else {
            return Err(Error::InvalidState(state));
        };

        if pool.needs_resize(width, height) {
            // Move scanout off the buffers which are about to be destroyed.
            if state == State::Presenting {
                if let (Some(output), Some(mode_buffer)) = (&self.output, pool.mode_buffer()) {
                    let framebuffer = mode_buffer.framebuffer();
                    if let Err(err) =
                        device.set_crtc(output.crtc, framebuffer, output.connector, &output.mode)
                    {
                        warn!("unable to restore mode-set buffer before resize: {err}");
                    }
                }
                self.state = State::ModeEstablished;
            }

            pool.resize(device, width, height, &mut self.capabilities)?;
        }

        let buffer = pool.back_buffer().ok_or(Error::InvalidState(state))?;
        let framebuffer = buffer.framebuffer();

        let (config, frame_count, logged) = (&self.config, self.frame_count, &mut self.logged);
        let flushed = buffer.map(device, |mapping| {
            let mut surface = mapping.surface();

            if config.test_pattern {
                pattern::fill(&mut surface, frame_count);
            } else {
                if logged.blit_path != Some((width, height)) {
                    logged.blit_path = Some((width, height));
                    info!(
                        "blit path: {width}x{height} -> {}x{} H={} V={}",
                        surface.width(),
                        surface.height(),
                        HorizontalPath::new(width, surface.width()),
                        pixels::vertical_direction(height, surface.height()),
                    );
                }

                pixels::blit(&source, &mut surface);
            }

            config.force_cache_flush.then(|| mapping.flush())
        })?;

        if let Some(Err(err)) = flushed {
            if !mem::replace(&mut self.logged.cache_flush, true) {
                warn!("scanout cache flush failed: {err}");
            }
        }

        let convert = start.elapsed();

        self.notify_damage(framebuffer);

        let flip_start = Instant::now();
        self.submit(framebuffer)?;
        let flip = flip_start.elapsed();

        if let Some(pool) = &mut self.pool {
            pool.swap();
        }
        self.frame_count += 1;

        self.record_timing(FrameTiming { convert, flip, total: start.elapsed(), ..Default::default() });

        Ok(())
    }

    /// Show an already prepared framebuffer.
    pub fn flip(&mut self, framebuffer: u32) -> Result<()> {
        self.flip_with_timing(framebuffer, Duration::ZERO)
    }

    /// Show a prepared framebuffer, accounting for time spent rendering it.
    pub(crate) fn flip_with_timing(&mut self, framebuffer: u32, gpu: Duration) -> Result<()> {
        self.ensure_active()?;

        let start = Instant::now();

        self.notify_damage(framebuffer);
        self.submit(framebuffer)?;
        self.frame_count += 1;

        let flip = start.elapsed();
        self.record_timing(FrameTiming { gpu, flip, total: gpu + flip, ..Default::default() });

        Ok(())
    }

    /// Release every buffer and the display device.
    ///
    /// Safe to call in any state, and more than once.
    pub fn cleanup(&mut self) {
        if self.state == State::Closed {
            return;
        }

        if let Some(device) = &self.device {
            for buffer in &mut self.exported {
                buffer.destroy(device);
            }

            if let Some(pool) = &mut self.pool {
                pool.destroy(device);
            }

            if let Err(err) = device.release_master() {
                debug!("unable to drop DRM master: {err}");
            }
        }

        self.exported.clear();
        self.pool = None;
        self.device = None;
        self.state = State::Closed;

        info!("presentation session closed after {} frames", self.frame_count);
    }

    /// Allocate native resolution buffers and export them for GPU import.
    pub fn export_buffers(&mut self, count: usize) -> Result<Vec<ExportedBuffer>> {
        self.ensure_active()?;
        self.release_exported();

        let state = self.state;
        let (Some(device), Some(output)) = (self.device.as_ref(), self.output.as_ref()) else {
            return Err(Error::InvalidState(state));
        };

        let (width, height) = (output.mode.width, output.mode.height);
        let mut buffers = Vec::with_capacity(count);
        let mut result = Ok(());
        for _ in 0..count {
            let caps = &mut self.capabilities;
            let buffer = match ScanoutBuffer::allocate(device, width, height, caps) {
                Ok(buffer) => buffer,
                Err(err) => {
                    result = Err(err);
                    break;
                },
            };

            let exported = ExportedBuffer::export(device, &buffer);
            self.exported.push(buffer);

            match exported {
                Ok(exported) => buffers.push(exported),
                Err(err) => {
                    result = Err(err);
                    break;
                },
            }
        }

        match result {
            Ok(()) => Ok(buffers),
            Err(err) => {
                self.release_exported();
                Err(err)
            },
        }
    }

    /// Destroy all buffers created by [`Self::export_buffers`].
    pub fn release_exported(&mut self) {
        if let Some(device) = &self.device {
            for buffer in &mut self.exported {
                buffer.destroy(device);
            }
        }
        self.exported.clear();
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of successfully presented frames.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn capabilities_mut(&mut self) -> &mut Capabilities {
        &mut self.capabilities
    }

    pub fn output(&self) -> Option<&Discovery<D::Mode>> {
        self.output.as_ref()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Index of the buffer written by the next [`Self::present`].
    pub fn current_index(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.index())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            State::ModeEstablished | State::Presenting => Ok(()),
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Tell the driver the framebuffer was modified, if it cares.
    fn notify_damage(&mut self, framebuffer: u32) {
        let Some(device) = &self.device else { return };
        let capability = &mut self.capabilities.dirty_framebuffer;
        if !capability.usable() {
            return;
        }

        let result = device.dirty_framebuffer(framebuffer);
        if !capability.resolve("framebuffer damage notification", &result) {
            if let Err(err) = result {
                debug!("framebuffer damage notification failed: {err}");
            }
        }
    }

    /// Put a framebuffer on screen.
    fn submit(&mut self, framebuffer: u32) -> Result<()> {
        let result = self.try_submit(framebuffer);
        result.map_err(|err| self.frame_failure(err))
    }

    fn try_submit(&mut self, framebuffer: u32) -> Result<()> {
        let state = self.state;
        let (Some(device), Some(output)) = (self.device.as_ref(), self.output) else {
            return Err(Error::InvalidState(state));
        };
        let pacing = !self.config.disable_vblank_pacing;

        match state {
            State::ModeEstablished => {
                device
                    .set_crtc(output.crtc, framebuffer, output.connector, &output.mode)
                    .map_err(Error::ModeSet)?;

                debug!("first frame shown through mode-set");
                self.state = State::Presenting;

                Ok(())
            },
            State::Presenting if self.capabilities.page_flip.usable() => {
                match page_flip(device, &output, framebuffer, pacing, &mut self.logged) {
                    Ok(()) => {
                        self.capabilities.page_flip.resolve::<_, Error>("page flip", &Ok(()));
                        Ok(())
                    },
                    Err(err) if self.capabilities.page_flip.is_untested() && !kms::is_busy(&err) => {
                        self.capabilities.page_flip.resolve::<(), _>("page flip", &Err(err));
                        let (config, caps) = (&self.config, &mut self.capabilities);
                        fallback_submit(device, &output, framebuffer, config, caps, &mut self.logged)
                    },
                    Err(err) => Err(Error::FlipFailed(err)),
                }
            },
            State::Presenting => {
                let (config, caps) = (&self.config, &mut self.capabilities);
                fallback_submit(device, &output, framebuffer, config, caps, &mut self.logged)
            },
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Log a dropped frame, once for every kind of failure.
    fn frame_failure(&mut self, err: Error) -> Error {
        let errno = match &err {
            Error::FlipFailed(err) | Error::ModeSet(err) => err.raw_os_error(),
            _ => None,
        };

        if self.logged.frame_failures.insert((mem::discriminant(&err), errno)) {
            warn!("dropping frame: {err}");
        } else {
            debug!("dropping frame: {err}");
        }

        err
    }

    fn record_timing(&mut self, timing: FrameTiming) {
        if let Some(perf) = &mut self.perf {
            perf.record(timing);
        }
    }
}

impl<D: KmsDevice> Drop for PresentationSession<D> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Request a page flip, retrying once after vblank if one is still pending.
fn page_flip<D: KmsDevice>(
    device: &D,
    output: &Discovery<D::Mode>,
    framebuffer: u32,
    pacing: bool,
    logged: &mut LoggedOnce,
) -> io::Result<()> {
    match device.page_flip(output.crtc, framebuffer) {
        Err(err) if kms::is_busy(&err) => {
            if pacing {
                wait_vblank(device, output, logged);
            }
            device.page_flip(output.crtc, framebuffer)
        },
        result => result,
    }
}

/// Submit without page flips, using plane updates where possible.
fn fallback_submit<D: KmsDevice>(
    device: &D,
    output: &Discovery<D::Mode>,
    framebuffer: u32,
    config: &Config,
    capabilities: &mut Capabilities,
    logged: &mut LoggedOnce,
) -> Result<()> {
    let plane = output.plane.filter(|_| !config.disable_hw_plane && capabilities.plane_update.usable());

    if let Some(plane) = plane {
        if !config.disable_vblank_pacing {
            wait_vblank(device, output, logged);
        }

        let (width, height) = (output.mode.width, output.mode.height);
        match device.set_plane(plane.id, output.crtc, framebuffer, width, height) {
            Ok(()) => {
                capabilities.plane_update.resolve::<_, Error>("plane update", &Ok(()));
                return Ok(());
            },
            Err(err) => capabilities.plane_update.disable("plane update", err),
        }
    }

    device.set_crtc(output.crtc, framebuffer, output.connector, &output.mode).map_err(Error::ModeSet)
}

fn wait_vblank<D: KmsDevice>(
    device: &D,
    output: &Discovery<D::Mode>,
    logged: &mut LoggedOnce,
) {
    if let Err(err) = device.wait_vblank(output.crtc_index) {
        if !mem::replace(&mut logged.vblank, true) {
            warn!("vblank wait failed, presenting unpaced: {err}");
        }
    }
}
