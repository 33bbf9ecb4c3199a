//! Prelude module - commonly used types for convenient import.
//!
//! Use `use tabula_sandbox::prelude::*;` to import all essential types.

// Errors
pub use crate::{SandboxError, SandboxResult};

// Limits and permissions
pub use crate::{HostPrimitive, PermissionSet, ResourceLimits, ResourceUsage};

// Scanning
pub use crate::{ScanReport, Severity, Threat, ThreatScanner};

// Rate limiting
pub use crate::{RateLimit, RateLimitResult, RateLimiter};

// Sandboxes
pub use crate::{LogLevel, PluginSandbox, SecurityService};
