//! Configuration types for the Tabula plugin host.
//!
//! All types in this module are self-contained with no dependencies on other
//! internal tabula crates. Domain types (resource limits, log config) are
//! mirrored here and converted at the boundary. Every struct implements
//! [`Default`] so that a bare `[section]` header in TOML produces a working
//! configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the plugin host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host engine identity.
    pub host: HostSection,
    /// Plugin discovery and persistence.
    pub plugins: PluginsSection,
    /// Default sandbox resource limits.
    pub sandbox: SandboxSection,
    /// Audit log bounds.
    pub audit: AuditSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// HostSection
// ---------------------------------------------------------------------------

/// Host engine identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    /// Semver version of the host engine. Plugin manifests declare the
    /// range of host versions they support.
    pub version: String,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Plugin discovery and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directories scanned for plugin manifests.
    pub directories: Vec<PathBuf>,
    /// Manifest file name looked for in each plugin directory.
    pub manifest_file: String,
    /// JSON file registrations are persisted to. `None` keeps state in memory.
    pub state_file: Option<PathBuf>,
    /// Enable plugins automatically after discovery.
    pub auto_enable: bool,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            manifest_file: "plugin.toml".to_owned(),
            state_file: None,
            auto_enable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxSection
// ---------------------------------------------------------------------------

/// Default resource limits applied to every plugin sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Tracked memory ceiling in bytes.
    pub memory_bytes: u64,
    /// Wall-clock budget per execution, in seconds.
    pub cpu_seconds: u64,
    /// Tracked disk quota in bytes.
    pub disk_bytes: u64,
    /// Network host calls allowed per minute.
    pub network_calls_per_minute: u32,
    /// Database host calls allowed per minute.
    pub database_calls_per_minute: u32,
    /// Refuse WASM units whose manifest omits a blake3 hash.
    pub require_hash: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            cpu_seconds: 30,
            disk_bytes: 100 * 1024 * 1024,
            network_calls_per_minute: 60,
            database_calls_per_minute: 600,
            require_hash: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditSection
// ---------------------------------------------------------------------------

/// Audit log bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Maximum retained events.
    pub capacity: usize,
    /// Maximum event age in days.
    pub max_age_days: u32,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_age_days: 7,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"compact"`, `"pretty"` or `"json"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["tabula_plugins=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
