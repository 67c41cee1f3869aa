//! Presentation error taxonomy.

use std::io;

use thiserror::Error;

/// Result type used throughout the backend.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no connected connector with at least one mode")]
    NoConnector,

    #[error("no CRTC usable with connector {0}")]
    NoCrtc(u32),

    #[error("invalid source stride: stride={stride} width={width} (need >= {required})")]
    InvalidStride { stride: u32, width: u32, required: u32 },

    #[error("invalid source frame: {0}")]
    InvalidSource(String),

    #[error("operation not allowed in state {0:?}")]
    InvalidState(crate::session::State),

    #[error("scanout buffer allocation failed ({width}x{height}): {source}")]
    Allocation {
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },

    #[error("mode-set failed: {0}")]
    ModeSet(#[source] io::Error),

    #[error("page flip failed: {0}")]
    FlipFailed(#[source] io::Error),

    #[error("zero-copy path unavailable: {0}")]
    ZeroCopy(String),

    #[error("GPU frame failed: {0}")]
    Gpu(String),
}

impl Error {
    /// Whether this error only dropped a single frame.
    pub fn is_frame_drop(&self) -> bool {
        matches!(self, Self::FlipFailed(_) | Self::ModeSet(_) | Self::Gpu(_))
    }
}
