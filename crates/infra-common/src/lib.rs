//! Common infrastructure for the rvoip call broker
//!
//! Shared pieces every binary in the workspace needs: a common error type for
//! configuration and startup failures, and the `tracing` subscriber setup.

pub mod errors;
pub mod logging;

pub use errors::{Error, ErrorContext, ErrorExt, Result};
pub use logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
