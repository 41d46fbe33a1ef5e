//! Process-wide tracing setup shared by the binaries.
//!
//! Call [`init_with`] once at startup; subsequent calls are no-ops.

/// Subscriber configuration and installation.
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat, ParseLogFormatError, init_with};
