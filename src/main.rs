use std::path::PathBuf;
use std::time::Instant;
use std::{env, process};

use clap::Parser;
use drm_scanout::{Card, Config, PresentationSession};
#[cfg(feature = "profiling")]
use profiling::puffin;
#[cfg(feature = "profiling")]
use puffin_http::Server;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command line arguments.
#[derive(Parser, Debug)]
#[clap(author, about, version, max_term_width = 80)]
struct Options {
    /// DRM device node, defaults to the seat's primary GPU.
    #[clap(long, env = "SCANOUT_DEVICE")]
    device: Option<PathBuf>,

    /// Number of frames to present.
    #[clap(long, default_value_t = 300)]
    frames: u64,

    /// Width of the generated source frames.
    #[clap(long, default_value_t = 640, value_parser = clap::value_parser!(u32).range(1..))]
    width: u32,

    /// Height of the generated source frames.
    #[clap(long, default_value_t = 480, value_parser = clap::value_parser!(u32).range(1..))]
    height: u32,

    /// Show the built-in test pattern instead of the source frames.
    #[clap(long)]
    test_pattern: bool,

    /// Flush CPU writes to scanout memory before every flip.
    #[clap(long)]
    force_cache_flush: bool,

    /// Never use plane updates.
    #[clap(long)]
    disable_hw_plane: bool,

    /// Prefer overlay planes over primary planes.
    #[clap(long)]
    prefer_overlay_plane: bool,

    /// Do not wait for vblank before retrying busy flips.
    #[clap(long)]
    disable_vblank_pacing: bool,

    /// Log frame statistics every second.
    #[clap(long)]
    perf_stats: bool,

    /// Print the effective configuration as JSON and exit.
    #[clap(long)]
    print_config: bool,
}

impl Options {
    /// Combine command line switches with the environment.
    fn config(&self) -> Config {
        let mut config = Config::from_env();
        config.test_pattern |= self.test_pattern;
        config.force_cache_flush |= self.force_cache_flush;
        config.disable_hw_plane |= self.disable_hw_plane;
        config.prefer_overlay_plane |= self.prefer_overlay_plane;
        config.disable_vblank_pacing |= self.disable_vblank_pacing;
        config.perf_stats |= self.perf_stats;
        config
    }
}

pub fn main() {
    #[cfg(feature = "profiling")]
    let _server = {
        puffin::set_scopes_on(true);
        Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT)).unwrap()
    };

    // Setup logging.
    let directives = env::var("RUST_LOG").unwrap_or("warn,drm_scanout=info".into());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    FmtSubscriber::builder().with_env_filter(env_filter).with_line_number(true).init();

    let options = Options::parse();
    let config = options.config();

    if options.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("\x1b[31merror\x1b[0m: {err}"),
        }
        return;
    }

    if let Err(err) = run(&options, config) {
        eprintln!("\x1b[31merror\x1b[0m: {err}");
        process::exit(1);
    }
}

/// Present generated frames on the display.
fn run(options: &Options, config: Config) -> drm_scanout::Result<()> {
    let path = options.device.clone().unwrap_or_else(Card::primary_path);
    let card = Card::open(path)?;
    info!("using DRM device {:?}", card.path());

    let mut session = PresentationSession::new(card, config);
    session.init()?;

    let (width, height) = (options.width, options.height);
    let stride = width * 4;
    let mut pixels = vec![0; stride as usize * height as usize];

    let start = Instant::now();
    let mut dropped = 0;
    for frame in 0..options.frames {
        render(&mut pixels, width, height, frame);

        match session.present(&pixels, width, height, stride) {
            Ok(()) => (),
            Err(err) if err.is_frame_drop() => dropped += 1,
            Err(err) => {
                error!("presentation failed: {err}");
                return Err(err);
            },
        }

        #[cfg(feature = "profiling")]
        profiling::finish_frame!();
    }

    let elapsed = start.elapsed().as_secs_f64();
    let shown = session.frame_count();
    info!("presented {shown} frames in {elapsed:.2}s ({:.1} fps)", shown as f64 / elapsed);
    if dropped > 0 {
        warn!("dropped {dropped} frames");
    }

    session.cleanup();

    Ok(())
}

/// Draw a scrolling RGBA gradient.
fn render(pixels: &mut [u8], width: u32, height: u32, frame: u64) {
    let offset = (frame % u64::from(width)) as u32;
    for (y, row) in pixels.chunks_exact_mut(width as usize * 4).enumerate() {
        let y = y as u32;
        for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
            let x = x as u32;
            let r = (x + offset) % width * 255 / width;
            let g = y * 255 / height;
            let b = (x ^ y).wrapping_add(offset.wrapping_mul(2)) & 0xFF;
            pixel.copy_from_slice(&[r as u8, g as u8, b as u8, 0xFF]);
        }
    }
}
