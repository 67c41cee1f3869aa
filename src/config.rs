//! Backend configuration.

use std::env;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable prefix for all switches.
const ENV_PREFIX: &str = "SCANOUT_";

/// Diagnostic and workaround switches.
///
/// All switches default to off and are read once when the session is created.
#[derive(Deserialize, Serialize, Copy, Clone, Default, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct Config {
    /// Replace the source blit with a generated test pattern.
    pub test_pattern: bool,

    /// Flush CPU writes to the scanout mapping before every flip.
    pub force_cache_flush: bool,

    /// Never use plane updates, only CRTC mode-sets.
    pub disable_hw_plane: bool,

    /// Prefer an overlay plane over the primary plane.
    pub prefer_overlay_plane: bool,

    /// Retry busy flips immediately instead of waiting for vblank.
    pub disable_vblank_pacing: bool,

    /// Emit a performance summary once per second.
    pub perf_stats: bool,
}

impl Config {
    /// Read all switches from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Read all switches through a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| lookup(name).is_some_and(|value| is_truthy(&value));

        let config = Self {
            test_pattern: flag("TEST_PATTERN"),
            force_cache_flush: flag("FORCE_MSYNC"),
            disable_hw_plane: flag("DISABLE_PLANE"),
            prefer_overlay_plane: flag("USE_OVERLAY"),
            disable_vblank_pacing: flag("NO_VBLANK_SYNC"),
            perf_stats: flag("PERF"),
        };
        config.log();

        config
    }

    /// Log the effective switches.
    pub fn log(&self) {
        info!(
            test_pattern = self.test_pattern,
            force_cache_flush = self.force_cache_flush,
            disable_hw_plane = self.disable_hw_plane,
            prefer_overlay_plane = self.prefer_overlay_plane,
            disable_vblank_pacing = self.disable_vblank_pacing,
            perf_stats = self.perf_stats,
            "scanout configuration"
        );
    }
}

/// Check if a switch value enables the switch.
///
/// Any non-empty value not starting with `0` counts as enabled.
fn is_truthy(value: &str) -> bool {
    !value.is_empty() && !value.starts_with('0')
}
