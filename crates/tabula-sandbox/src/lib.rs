//! Tabula Sandbox - the security boundary around plugin code.
//!
//! Provides:
//! - [`ThreatScanner`]: static regex scan of plugin source, run before load
//! - [`ResourceLimits`] and [`ResourceUsage`]: per-plugin budgets
//! - [`RateLimiter`]: sliding windows keyed by `(plugin, resource)`
//! - [`PluginSandbox`]: execution timeout, host primitives, metered host calls
//! - [`SecurityService`]: owner of the above plus the audit log
//!
//! # Security Model
//!
//! The sandbox is a cooperative boundary. It bounds wall-clock time,
//! tracked memory and disk, and the rate of network and database calls,
//! and it refuses code with critical threat findings. It does not defend
//! against hostile native code running in the host process.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod limits;
mod permission;
mod rate_limit;
mod sandbox;
mod scanner;
mod service;
#[cfg(feature = "wasm")]
mod wasm;

pub use error::{SandboxError, SandboxResult};
pub use limits::{
    DEFAULT_CPU_SECONDS, DEFAULT_DATABASE_CALLS_PER_MINUTE, DEFAULT_DISK_BYTES,
    DEFAULT_MEMORY_BYTES, DEFAULT_NETWORK_CALLS_PER_MINUTE, HostPrimitive, LimitedResource,
    ResourceLimits, ResourceUsage,
};
pub use permission::{PermissionSet, permission_matches};
pub use rate_limit::{RateLimit, RateLimitResult, RateLimiter};
pub use sandbox::{DATABASE_RESOURCE, LogLevel, NETWORK_RESOURCE, PluginSandbox};
pub use scanner::{ScanReport, Threat, ThreatCategory, ThreatScanner};
pub use service::SecurityService;
#[cfg(feature = "wasm")]
pub use wasm::WasmModule;

pub use tabula_audit::Severity;
