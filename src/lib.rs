//! KMS frame presentation.
//!
//! This library shows frames produced by a renderer on a display driven
//! through kernel mode-setting, with CPU conversion and upscaling into dumb
//! buffers or zero-copy GPU blits into exported scanout buffers.

pub mod buffer;
pub mod capability;
pub mod config;
pub mod discovery;
pub mod error;
pub mod kms;
pub mod perf;
pub mod pixels;
pub mod session;
pub mod zero_copy;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::kms::Card;
pub use crate::session::{PresentationSession, State};
pub use crate::zero_copy::{CpuFrame, ExportedBuffer, GpuImporter, GpuResult, ZeroCopy};
