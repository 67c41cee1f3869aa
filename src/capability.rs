//! Lazily probed driver capabilities.

use std::fmt::Display;

use tracing::{info, warn};

/// Tri-state capability flag.
///
/// A capability starts out untested and is resolved exactly once. After that
/// it never changes for the rest of the session.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub enum Capability {
    #[default]
    Untested,
    Supported,
    Unsupported,
}

impl Capability {
    /// Check if the capability may still be used.
    ///
    /// This is `true` for both supported and not yet tested capabilities.
    pub fn usable(self) -> bool {
        self != Self::Unsupported
    }

    pub fn is_untested(self) -> bool {
        self == Self::Untested
    }

    /// Resolve the capability from the first attempt's outcome.
    ///
    /// Resolved capabilities are never changed again. Returns `true` if this
    /// call resolved the flag.
    pub fn resolve<T, E: Display>(&mut self, name: &str, result: &Result<T, E>) -> bool {
        if *self != Self::Untested {
            return false;
        }

        match result {
            Ok(_) => {
                info!("{name} supported");
                *self = Self::Supported;
            },
            Err(err) => {
                warn!("{name} unsupported ({err})");
                *self = Self::Unsupported;
            },
        }

        true
    }

    /// Permanently disable the capability.
    pub fn disable(&mut self, name: &str, reason: impl Display) {
        if *self != Self::Unsupported {
            warn!("disabling {name}: {reason}");
            *self = Self::Unsupported;
        }
    }
}

/// All capabilities tracked by a presentation session.
#[derive(Copy, Clone, Default, Debug)]
pub struct Capabilities {
    /// Legacy framebuffer registration without explicit pixel format.
    pub legacy_framebuffer: Capability,

    /// Damage notification for CPU-written framebuffers.
    pub dirty_framebuffer: Capability,

    /// Non-blocking page flips.
    pub page_flip: Capability,

    /// Unscaled plane updates as page flip replacement.
    pub plane_update: Capability,

    /// GPU import of exported scanout buffers.
    pub zero_copy: Capability,
}
