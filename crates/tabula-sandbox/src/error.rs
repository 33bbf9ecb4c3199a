//! Sandbox error types.

use std::time::Duration;

use thiserror::Error;

use crate::limits::{HostPrimitive, LimitedResource};
use crate::scanner::Threat;

/// Errors raised while scanning, metering or running plugin code.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The static scan found at least one critical threat.
    #[error("plugin {plugin} blocked: {} critical threat(s) found", threats.len())]
    ThreatDetected {
        /// Plugin whose code was scanned.
        plugin: String,
        /// The blocking threats.
        threats: Vec<Threat>,
    },

    /// Execution exceeded the wall-clock budget.
    #[error("plugin {plugin} timed out after {limit:?} in {operation}")]
    Timeout {
        /// Offending plugin.
        plugin: String,
        /// What was running.
        operation: String,
        /// The budget that was exceeded.
        limit: Duration,
    },

    /// A metered resource would exceed its limit.
    #[error("plugin {plugin} exceeded {resource} limit ({requested} > {limit})")]
    ResourceLimit {
        /// Offending plugin.
        plugin: String,
        /// Which resource.
        resource: LimitedResource,
        /// Configured limit.
        limit: u64,
        /// Amount that would have been in use.
        requested: u64,
    },

    /// A rate-limited host call was refused.
    #[error("plugin {plugin} rate limited on {resource}; retry after {retry_after:?}")]
    RateLimited {
        /// Offending plugin.
        plugin: String,
        /// Rate-limited resource.
        resource: String,
        /// Time until the window resets.
        retry_after: Duration,
    },

    /// The plugin lacks a permission for a host call.
    #[error("plugin {plugin} lacks permission '{permission}'")]
    PermissionDenied {
        /// Offending plugin.
        plugin: String,
        /// The missing permission.
        permission: String,
    },

    /// The plugin touched a host primitive outside its allow-list.
    #[error("plugin {plugin} may not use host primitive {primitive}")]
    PrimitiveNotAllowed {
        /// Offending plugin.
        plugin: String,
        /// The primitive.
        primitive: HostPrimitive,
    },

    /// A custom scanner rule failed to compile.
    #[error("invalid threat pattern '{rule}': {source}")]
    InvalidPattern {
        /// Rule identifier.
        rule: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// Guest code failed to load or trapped.
    #[error("execution failed in plugin {plugin}: {message}")]
    Execution {
        /// Offending plugin.
        plugin: String,
        /// Failure detail.
        message: String,
    },
}

impl SandboxError {
    /// Name of the plugin the error concerns, if any.
    #[must_use]
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::ThreatDetected { plugin, .. }
            | Self::Timeout { plugin, .. }
            | Self::ResourceLimit { plugin, .. }
            | Self::RateLimited { plugin, .. }
            | Self::PermissionDenied { plugin, .. }
            | Self::PrimitiveNotAllowed { plugin, .. }
            | Self::Execution { plugin, .. } => Some(plugin),
            Self::InvalidPattern { .. } => None,
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;
