//! Audit-related error types.

use thiserror::Error;

/// Errors that can occur with audit logging.
///
/// Recording an event never fails; these only surface from exports.
#[derive(Debug, Error)]
pub enum AuditError {
    /// I/O error while exporting the log.
    #[error("audit export failed at {path}: {source}")]
    Io {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;
