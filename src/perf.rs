//! Frame timing statistics.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::info;

/// Interval between two summaries.
const WINDOW: Duration = Duration::from_secs(1);

/// CPU clock of the first core, in kHz.
const CPU_FREQ: &str = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq";

/// Directory of devfreq devices, with clocks in Hz.
const DEVFREQ: &str = "/sys/class/devfreq";

/// Stage durations of a single frame.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct FrameTiming {
    /// CPU conversion into the scanout buffer.
    pub convert: Duration,
    /// GPU blit and fence wait.
    pub gpu: Duration,
    /// Framebuffer submission.
    pub flip: Duration,
    pub total: Duration,
}

#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct StageStats {
    pub sum: Duration,
    pub max: Duration,
}

impl StageStats {
    fn add(&mut self, duration: Duration) {
        self.sum += duration;
        self.max = self.max.max(duration);
    }

    /// Average duration over `frames`.
    pub fn average(&self, frames: u32) -> Duration {
        self.sum.checked_div(frames).unwrap_or_default()
    }
}

/// Statistics emitted once per window.
#[derive(Clone, PartialEq, Debug)]
pub struct PerfSummary {
    pub frames: u32,
    pub fps: f64,
    pub convert: StageStats,
    pub gpu: StageStats,
    pub flip: StageStats,
    pub total: StageStats,
    pub cpu_khz: Option<u64>,
    pub gpu_hz: Option<u64>,
}

impl PerfSummary {
    pub fn log(&self) {
        let ms = |duration: Duration| duration.as_secs_f64() * 1000.;
        let frames = self.frames;
        info!(
            fps = self.fps,
            convert_avg_ms = ms(self.convert.average(frames)),
            convert_max_ms = ms(self.convert.max),
            gpu_avg_ms = ms(self.gpu.average(frames)),
            gpu_max_ms = ms(self.gpu.max),
            flip_avg_ms = ms(self.flip.average(frames)),
            flip_max_ms = ms(self.flip.max),
            total_avg_ms = ms(self.total.average(frames)),
            total_max_ms = ms(self.total.max),
            cpu_khz = self.cpu_khz,
            gpu_hz = self.gpu_hz,
            "frame statistics"
        );
    }
}

/// Rolling one second statistics window.
#[derive(Debug)]
pub struct PerfWindow {
    start: Instant,
    frames: u32,
    convert: StageStats,
    gpu: StageStats,
    flip: StageStats,
    total: StageStats,
    clocks: ClockSource,
}

impl PerfWindow {
    pub fn new(clocks: ClockSource) -> Self {
        Self::starting_at(clocks, Instant::now())
    }

    fn starting_at(clocks: ClockSource, start: Instant) -> Self {
        Self {
            clocks,
            start,
            frames: Default::default(),
            convert: Default::default(),
            gpu: Default::default(),
            flip: Default::default(),
            total: Default::default(),
        }
    }

    /// Add a frame, logging a summary when the window is complete.
    pub fn record(&mut self, timing: FrameTiming) -> Option<PerfSummary> {
        let summary = self.record_at(timing, Instant::now())?;
        summary.log();
        Some(summary)
    }

    fn record_at(&mut self, timing: FrameTiming, now: Instant) -> Option<PerfSummary> {
        self.frames += 1;
        self.convert.add(timing.convert);
        self.gpu.add(timing.gpu);
        self.flip.add(timing.flip);
        self.total.add(timing.total);

        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < WINDOW {
            return None;
        }

        let summary = PerfSummary {
            frames: self.frames,
            fps: self.frames as f64 / elapsed.as_secs_f64(),
            convert: self.convert,
            gpu: self.gpu,
            flip: self.flip,
            total: self.total,
            cpu_khz: self.clocks.cpu_khz(),
            gpu_hz: self.clocks.gpu_hz(),
        };

        let clocks = std::mem::take(&mut self.clocks);
        *self = Self::starting_at(clocks, now);

        Some(summary)
    }
}

/// Best effort clock frequency readings.
#[derive(Clone, Default, Debug)]
pub struct ClockSource {
    cpu: Option<PathBuf>,
    gpu: Option<PathBuf>,
}

impl ClockSource {
    /// Locate the clocks exposed through sysfs.
    pub fn sysfs() -> Self {
        Self::scan(Path::new(CPU_FREQ), Path::new(DEVFREQ))
    }

    /// Locate the CPU clock file and the first GPU devfreq device.
    pub fn scan(cpu: &Path, devfreq: &Path) -> Self {
        let cpu = cpu.exists().then(|| cpu.to_path_buf());

        let gpu = fs::read_dir(devfreq).ok().and_then(|entries| {
            let mut devices: Vec<_> = entries.flatten().map(|entry| entry.path()).collect();
            devices.sort();
            devices.into_iter().find_map(|device| {
                let name = device.file_name()?.to_string_lossy().to_lowercase();
                let is_gpu = name.contains("gpu") || name.contains("mali");
                let path = device.join("cur_freq");
                (is_gpu && path.exists()).then_some(path)
            })
        });

        Self { cpu, gpu }
    }

    pub fn cpu_khz(&self) -> Option<u64> {
        read_value(self.cpu.as_deref()?)
    }

    pub fn gpu_hz(&self) -> Option<u64> {
        read_value(self.gpu.as_deref()?)
    }
}

fn read_value(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
