//! Telemetry error types.

use thiserror::Error;

/// Errors raised while installing logging.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A level, directive or format does not parse.
    #[error("invalid logging configuration: {0}")]
    InvalidConfig(String),

    /// The subscriber or the file writer could not be set up.
    #[error("cannot initialise logging: {0}")]
    Init(String),

    /// The log directory could not be created.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
