//! Per-plugin sandbox: execution budget, host primitives and metered calls.
//!
//! A [`PluginSandbox`] is the only surface plugin code sees of the host.
//! Everything it does is bounded by [`ResourceLimits`], checked against the
//! plugin's declared permissions, and recorded in the audit log.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tabula_audit::{AuditEvent, AuditEventKind, AuditLog, Severity};
use tracing::{debug, error, info, trace, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::limits::{HostPrimitive, LimitedResource, ResourceLimits, ResourceUsage};
use crate::permission::PermissionSet;
use crate::rate_limit::{RateLimit, RateLimitResult, RateLimiter};

/// Resource key used for network rate limiting.
pub const NETWORK_RESOURCE: &str = "network";
/// Resource key used for database rate limiting.
pub const DATABASE_RESOURCE: &str = "database";

/// Log level plugin code may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

/// Execution context bound to a single plugin.
#[derive(Debug)]
pub struct PluginSandbox {
    plugin_name: String,
    permissions: PermissionSet,
    limits: ResourceLimits,
    primitives: BTreeSet<HostPrimitive>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    usage: Mutex<ResourceUsage>,
}

impl PluginSandbox {
    /// Create a sandbox with every host primitive allowed.
    #[must_use]
    pub fn new(
        plugin_name: impl Into<String>,
        permissions: PermissionSet,
        limits: ResourceLimits,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            permissions,
            limits,
            primitives: HostPrimitive::ALL.into_iter().collect(),
            rate_limiter,
            audit,
            usage: Mutex::new(ResourceUsage::default()),
        }
    }

    /// Restrict the host primitive allow-list.
    #[must_use]
    pub fn with_primitives(mut self, primitives: impl IntoIterator<Item = HostPrimitive>) -> Self {
        self.primitives = primitives.into_iter().collect();
        self
    }

    /// The plugin this sandbox belongs to.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// The limits in force.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The plugin's declared permissions.
    #[must_use]
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Current usage snapshot.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        *self.lock_usage()
    }

    // Usage is plain counters; a poisoned guard still holds valid data.
    fn lock_usage(&self) -> MutexGuard<'_, ResourceUsage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_usage(&self, f: impl FnOnce(&mut ResourceUsage)) {
        f(&mut self.lock_usage());
    }

    fn event(&self, kind: AuditEventKind) -> AuditEvent {
        AuditEvent::new(self.plugin_name.clone(), kind)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run `future` under the execution timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Timeout`] if the future does not complete
    /// within [`ResourceLimits::execution_timeout`]. The timeout is recorded
    /// as a resource violation.
    pub async fn execute<F, T>(&self, operation: &str, future: F) -> SandboxResult<T>
    where
        F: Future<Output = T>,
    {
        let limit = self.limits.execution_timeout();
        if let Ok(value) = tokio::time::timeout(limit, future).await {
            self.update_usage(|u| u.executions = u.executions.saturating_add(1));
            trace!(plugin = %self.plugin_name, operation, "Sandboxed execution completed");
            Ok(value)
        } else {
            self.update_usage(|u| u.timeouts = u.timeouts.saturating_add(1));
            self.audit.record(
                self.event(AuditEventKind::ResourceViolation)
                    .with_resource(LimitedResource::Cpu.to_string())
                    .with_action(operation)
                    .with_severity(Severity::High)
                    .with_metadata("limit_secs", limit.as_secs()),
            );
            Err(SandboxError::Timeout {
                plugin: self.plugin_name.clone(),
                operation: operation.to_owned(),
                limit,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Host primitives
    // -----------------------------------------------------------------------

    /// Fail unless `primitive` is on the allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PrimitiveNotAllowed`] for primitives outside
    /// the allow-list.
    pub fn require_primitive(&self, primitive: HostPrimitive) -> SandboxResult<()> {
        if self.primitives.contains(&primitive) {
            Ok(())
        } else {
            self.audit.record(
                self.event(AuditEventKind::ApiAccess)
                    .with_resource(primitive.to_string())
                    .with_action("denied")
                    .with_severity(Severity::Medium),
            );
            Err(SandboxError::PrimitiveNotAllowed {
                plugin: self.plugin_name.clone(),
                primitive,
            })
        }
    }

    /// Emit a log line on behalf of the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PrimitiveNotAllowed`] if logging is disabled.
    pub fn log(&self, level: LogLevel, message: &str) -> SandboxResult<()> {
        self.require_primitive(HostPrimitive::Logging)?;
        let plugin = self.plugin_name.as_str();
        match level {
            LogLevel::Trace => trace!(plugin, "{message}"),
            LogLevel::Debug => debug!(plugin, "{message}"),
            LogLevel::Info => info!(plugin, "{message}"),
            LogLevel::Warn => warn!(plugin, "{message}"),
            LogLevel::Error => error!(plugin, "{message}"),
        }
        Ok(())
    }

    /// Sleep for `duration`, capped at the execution timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PrimitiveNotAllowed`] if timers are disabled.
    pub async fn sleep(&self, duration: Duration) -> SandboxResult<()> {
        self.require_primitive(HostPrimitive::Timers)?;
        tokio::time::sleep(duration.min(self.limits.execution_timeout())).await;
        Ok(())
    }

    /// Current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PrimitiveNotAllowed`] if dates are disabled.
    pub fn now(&self) -> SandboxResult<DateTime<Utc>> {
        self.require_primitive(HostPrimitive::Date)?;
        Ok(Utc::now())
    }

    // -----------------------------------------------------------------------
    // Permissions and metered host calls
    // -----------------------------------------------------------------------

    /// Check a permission and audit the decision.
    #[must_use]
    pub fn check_permission(&self, permission: &str) -> bool {
        let granted = self.permissions.allows(permission);
        self.audit.record(
            self.event(AuditEventKind::PermissionCheck)
                .with_resource(permission)
                .with_action(if granted { "granted" } else { "denied" })
                .with_severity(if granted { Severity::Info } else { Severity::Medium }),
        );
        granted
    }

    fn require_permission(&self, permission: &str) -> SandboxResult<()> {
        if self.check_permission(permission) {
            Ok(())
        } else {
            Err(SandboxError::PermissionDenied {
                plugin: self.plugin_name.clone(),
                permission: permission.to_owned(),
            })
        }
    }

    fn metered_call(&self, resource: &str, per_minute: u32, action: &str) -> SandboxResult<u32> {
        self.require_permission(resource)?;
        match self
            .rate_limiter
            .check(&self.plugin_name, resource, RateLimit::per_minute(per_minute))
        {
            RateLimitResult::Allowed { remaining, .. } => {
                self.audit.record(
                    self.event(AuditEventKind::ApiAccess)
                        .with_resource(resource)
                        .with_action(action),
                );
                Ok(remaining)
            },
            RateLimitResult::Denied { retry_after } => {
                self.audit.record(
                    self.event(AuditEventKind::RateLimited)
                        .with_resource(resource)
                        .with_action(action)
                        .with_severity(Severity::Medium)
                        .with_metadata("retry_after_ms", u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX)),
                );
                Err(SandboxError::RateLimited {
                    plugin: self.plugin_name.clone(),
                    resource: resource.to_owned(),
                    retry_after,
                })
            },
        }
    }

    /// Admit one network call to `target`. Returns the calls left in the window.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PermissionDenied`] without the `network`
    /// permission, or [`SandboxError::RateLimited`] past the per-minute limit.
    pub fn network_call(&self, target: &str) -> SandboxResult<u32> {
        let remaining =
            self.metered_call(NETWORK_RESOURCE, self.limits.network_calls_per_minute, target)?;
        self.update_usage(|u| u.network_calls = u.network_calls.saturating_add(1));
        Ok(remaining)
    }

    /// Admit one database call. Returns the calls left in the window.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PermissionDenied`] without the `database`
    /// permission, or [`SandboxError::RateLimited`] past the per-minute limit.
    pub fn database_call(&self, operation: &str) -> SandboxResult<u32> {
        let remaining = self.metered_call(
            DATABASE_RESOURCE,
            self.limits.database_calls_per_minute,
            operation,
        )?;
        self.update_usage(|u| u.database_calls = u.database_calls.saturating_add(1));
        Ok(remaining)
    }

    // -----------------------------------------------------------------------
    // Memory and disk accounting
    // -----------------------------------------------------------------------

    fn reserve(&self, resource: LimitedResource, bytes: u64) -> SandboxResult<()> {
        let limit = match resource {
            LimitedResource::Memory => self.limits.memory_bytes,
            _ => self.limits.disk_bytes,
        };
        let mut usage = self.lock_usage();
        let held = match resource {
            LimitedResource::Memory => &mut usage.memory_bytes,
            _ => &mut usage.disk_bytes,
        };
        let requested = held.saturating_add(bytes);
        if requested > limit {
            drop(usage);
            self.audit.record(
                self.event(AuditEventKind::ResourceViolation)
                    .with_resource(resource.to_string())
                    .with_action("reserve")
                    .with_severity(Severity::High)
                    .with_metadata("limit", limit)
                    .with_metadata("requested", requested),
            );
            return Err(SandboxError::ResourceLimit {
                plugin: self.plugin_name.clone(),
                resource,
                limit,
                requested,
            });
        }
        *held = requested;
        Ok(())
    }

    /// Reserve tracked memory.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ResourceLimit`] if the reservation would exceed
    /// the memory ceiling.
    pub fn allocate_memory(&self, bytes: u64) -> SandboxResult<()> {
        self.reserve(LimitedResource::Memory, bytes)
    }

    /// Release tracked memory.
    pub fn release_memory(&self, bytes: u64) {
        self.update_usage(|u| u.memory_bytes = u.memory_bytes.saturating_sub(bytes));
    }

    /// Reserve tracked disk space.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ResourceLimit`] if the write would exceed the
    /// disk quota.
    pub fn write_disk(&self, bytes: u64) -> SandboxResult<()> {
        self.reserve(LimitedResource::Disk, bytes)
    }

    /// Release tracked disk space.
    pub fn release_disk(&self, bytes: u64) {
        self.update_usage(|u| u.disk_bytes = u.disk_bytes.saturating_sub(bytes));
    }
}
