//! Tabula Telemetry - logging and tracing for the Tabula plugin host.
//!
//! - [`setup_logging`] installs console output in compact, pretty or JSON
//!   form, optionally mirrored to a rolling file
//! - [`OperationContext`] tags lifecycle work with a correlation id, the
//!   operation and the plugin it concerns
//!
//! # Example
//!
//! ```rust,no_run
//! use tabula_telemetry::{LogConfig, LogFormat, OperationContext, setup_logging};
//!
//! # fn main() -> Result<(), tabula_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("tabula_plugins=debug");
//! let _logging = setup_logging(&config)?;
//!
//! let ctx = OperationContext::new("host").with_operation("startup");
//! let _guard = ctx.span().entered();
//! tracing::info!("Host starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;

pub use context::OperationContext;
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, LoggingGuard,
    setup_default_logging, setup_logging,
};
