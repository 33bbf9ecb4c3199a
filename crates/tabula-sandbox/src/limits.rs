//! Resource limits, metered usage and the host primitive allow-list.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default memory ceiling (128 MiB).
pub const DEFAULT_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
/// Default CPU budget per execution, in seconds.
pub const DEFAULT_CPU_SECONDS: u64 = 30;
/// Default disk quota (100 MiB).
pub const DEFAULT_DISK_BYTES: u64 = 100 * 1024 * 1024;
/// Default network calls per minute.
pub const DEFAULT_NETWORK_CALLS_PER_MINUTE: u32 = 60;
/// Default database calls per minute.
pub const DEFAULT_DATABASE_CALLS_PER_MINUTE: u32 = 600;

/// Per-plugin resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum tracked memory in bytes.
    pub memory_bytes: u64,
    /// Wall-clock budget per execution, in seconds.
    pub cpu_seconds: u64,
    /// Maximum tracked disk usage in bytes.
    pub disk_bytes: u64,
    /// Network host calls allowed per minute.
    pub network_calls_per_minute: u32,
    /// Database host calls allowed per minute.
    pub database_calls_per_minute: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_seconds: DEFAULT_CPU_SECONDS,
            disk_bytes: DEFAULT_DISK_BYTES,
            network_calls_per_minute: DEFAULT_NETWORK_CALLS_PER_MINUTE,
            database_calls_per_minute: DEFAULT_DATABASE_CALLS_PER_MINUTE,
        }
    }
}

impl ResourceLimits {
    /// Tight limits for untrusted third-party plugins.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            memory_bytes: 32 * 1024 * 1024,
            cpu_seconds: 5,
            disk_bytes: 10 * 1024 * 1024,
            network_calls_per_minute: 10,
            database_calls_per_minute: 100,
        }
    }

    /// Set the memory ceiling.
    #[must_use]
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Set the CPU budget.
    #[must_use]
    pub fn with_cpu_seconds(mut self, seconds: u64) -> Self {
        self.cpu_seconds = seconds;
        self
    }

    /// Set the disk quota.
    #[must_use]
    pub fn with_disk_bytes(mut self, bytes: u64) -> Self {
        self.disk_bytes = bytes;
        self
    }

    /// Set the network call rate.
    #[must_use]
    pub fn with_network_calls_per_minute(mut self, calls: u32) -> Self {
        self.network_calls_per_minute = calls;
        self
    }

    /// Set the database call rate.
    #[must_use]
    pub fn with_database_calls_per_minute(mut self, calls: u32) -> Self {
        self.database_calls_per_minute = calls;
        self
    }

    /// Wall-clock timeout applied to every sandboxed execution.
    ///
    /// A zero CPU budget still gets one second so activation hooks can run.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.cpu_seconds.max(1))
    }
}

/// A resource the sandbox meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitedResource {
    /// Tracked memory.
    Memory,
    /// Wall-clock execution time.
    Cpu,
    /// Tracked disk usage.
    Disk,
    /// Network host calls.
    Network,
    /// Database host calls.
    Database,
}

impl fmt::Display for LimitedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Database => "database",
        })
    }
}

/// Host primitives sandboxed code may touch without a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPrimitive {
    /// Structured logging.
    Logging,
    /// Bounded sleeps.
    Timers,
    /// JSON encode/decode.
    Json,
    /// Math helpers.
    Math,
    /// Wall-clock date and time.
    Date,
}

impl HostPrimitive {
    /// Every primitive; the default allow-list.
    pub const ALL: [Self; 5] = [Self::Logging, Self::Timers, Self::Json, Self::Math, Self::Date];
}

impl fmt::Display for HostPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Logging => "logging",
            Self::Timers => "timers",
            Self::Json => "json",
            Self::Math => "math",
            Self::Date => "date",
        })
    }
}

/// Snapshot of what a sandbox has consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Tracked memory currently held.
    pub memory_bytes: u64,
    /// Tracked disk currently held.
    pub disk_bytes: u64,
    /// Network calls made (lifetime).
    pub network_calls: u64,
    /// Database calls made (lifetime).
    pub database_calls: u64,
    /// Completed executions.
    pub executions: u64,
    /// Executions that hit the timeout.
    pub timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.execution_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_cpu_budget_still_gets_a_second() {
        let limits = ResourceLimits::default().with_cpu_seconds(0);
        assert_eq!(limits.execution_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"cpu_seconds": 2}"#).unwrap();
        assert_eq!(limits.cpu_seconds, 2);
        assert_eq!(limits.disk_bytes, DEFAULT_DISK_BYTES);
    }

    #[test]
    fn test_strict_is_tighter() {
        let strict = ResourceLimits::strict();
        let default = ResourceLimits::default();
        assert!(strict.memory_bytes < default.memory_bytes);
        assert!(strict.cpu_seconds < default.cpu_seconds);
        assert!(strict.network_calls_per_minute < default.network_calls_per_minute);
    }
}
