//! Plugin error types.

use std::fmt;
use std::path::PathBuf;

use tabula_sandbox::SandboxError;

use crate::capability::Capability;
use crate::registration::PluginStatus;
use crate::resolver::DependencyReport;
use crate::validate::ValidationIssue;

/// Why a lifecycle transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    /// Required dependencies are missing or not enabled.
    MissingDependencies(Vec<String>),
    /// Enabled plugins still require this one.
    BlockingDependents(Vec<String>),
    /// Registered plugins of any status still require this one.
    RequiredBy(Vec<String>),
    /// The current status does not allow the action.
    InvalidTransition {
        /// Current status.
        from: PluginStatus,
        /// Attempted action.
        action: &'static str,
    },
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDependencies(deps) => {
                write!(f, "dependencies not enabled: {}", deps.join(", "))
            },
            Self::BlockingDependents(deps) => {
                write!(f, "required by enabled plugins: {}", deps.join(", "))
            },
            Self::RequiredBy(deps) => {
                write!(f, "required by installed plugins: {}", deps.join(", "))
            },
            Self::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a plugin that is {from}")
            },
        }
    }
}

/// Errors from plugin registry and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The manifest failed validation.
    #[error("manifest for {plugin} is invalid: {}", join_display(.issues))]
    Validation {
        /// Plugin name as declared.
        plugin: String,
        /// Error-severity issues.
        issues: Vec<ValidationIssue>,
    },

    /// Dependency resolution found cycles or version conflicts.
    #[error("dependency check failed for {plugin}: {}", .report.summary())]
    Dependency {
        /// Plugin being registered or updated.
        plugin: String,
        /// Full resolution report.
        report: DependencyReport,
    },

    /// The plugin claims mutually exclusive capabilities.
    #[error("plugin {plugin} claims conflicting capabilities: {}", join_display(.conflicts))]
    CapabilityConflict {
        /// Offending plugin.
        plugin: String,
        /// The conflicting capabilities.
        conflicts: Vec<Capability>,
    },

    /// The plugin does not declare permissions its capabilities require.
    #[error("plugin {plugin} is missing permissions: {}", .missing.join(", "))]
    Permission {
        /// Offending plugin.
        plugin: String,
        /// Permissions not covered by the manifest.
        missing: Vec<String>,
    },

    /// A lifecycle transition was refused.
    #[error("plugin {plugin}: {violation}")]
    LifecycleGuard {
        /// Plugin whose transition was refused.
        plugin: String,
        /// The guard that failed.
        violation: GuardViolation,
    },

    /// Scanning or sandboxed execution failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// No plugin with this name is registered.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// An update did not raise the version.
    #[error("plugin {plugin}: version {proposed} is not greater than {current}")]
    VersionNotGreater {
        /// Plugin being updated.
        plugin: String,
        /// Installed version.
        current: String,
        /// Proposed version.
        proposed: String,
    },

    /// A manifest file could not be parsed.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParse {
        /// Manifest path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// An artifact did not match its declared blake3 hash.
    #[error("plugin {plugin}: artifact hash mismatch (expected {expected}, got {actual})")]
    HashMismatch {
        /// Offending plugin.
        plugin: String,
        /// Declared hash.
        expected: String,
        /// Computed hash.
        actual: String,
    },

    /// The executable unit could not be created or activated.
    #[error("plugin {plugin} failed to activate: {message}")]
    Activation {
        /// Offending plugin.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// A handler failed without producing a result.
    #[error("handler {handler} failed: {message}")]
    Handler {
        /// Handler name.
        handler: String,
        /// Failure reason.
        message: String,
    },

    /// Registration state could not be saved or loaded.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Host configuration is unusable.
    #[error(transparent)]
    Config(#[from] tabula_config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Whether the error concerns only the plugin that raised it.
    ///
    /// Recoverable errors mark that plugin as errored; everything else is
    /// reported to the caller without touching registry state.
    #[must_use]
    pub fn is_recoverable_local(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::Dependency { .. }
                | Self::CapabilityConflict { .. }
                | Self::Permission { .. }
                | Self::Sandbox(_)
                | Self::HashMismatch { .. }
                | Self::Activation { .. }
        )
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
