//! Commonly used telemetry types.
//!
//! ```rust
//! use tabula_telemetry::prelude::*;
//! ```

pub use crate::{
    LogConfig, LogFormat, LogTarget, LoggingGuard, OperationContext, TelemetryError,
    TelemetryResult, setup_default_logging, setup_logging,
};
