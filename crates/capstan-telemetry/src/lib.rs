//! Capstan Telemetry - logging setup for hosts embedding the runtime.
//!
//! The runtime crates only emit `tracing` events; installing a subscriber is
//! the host's call. This crate packages the usual choices.
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), capstan_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("capstan_runtime=debug");
//! setup_logging(&config)?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
