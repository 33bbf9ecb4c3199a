//! The security service: one owner for scanning, sandboxes, rate limits and audit.

use std::sync::Arc;

use dashmap::DashMap;
use tabula_audit::{AuditEvent, AuditEventKind, AuditLog, Severity};
use tracing::{debug, info, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::limits::ResourceLimits;
use crate::permission::PermissionSet;
use crate::rate_limit::{RateLimit, RateLimitResult, RateLimiter};
use crate::sandbox::PluginSandbox;
use crate::scanner::{ScanReport, ThreatScanner};

/// Composes the scanner, the rate limiter, the audit log and the live
/// sandbox table. Shared across the host behind an `Arc`.
#[derive(Debug)]
pub struct SecurityService {
    scanner: ThreatScanner,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    sandboxes: DashMap<String, Arc<PluginSandbox>>,
    default_limits: ResourceLimits,
}

impl Default for SecurityService {
    fn default() -> Self {
        Self::new(Arc::new(AuditLog::default()))
    }
}

impl SecurityService {
    /// Create a service recording into `audit`.
    #[must_use]
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            scanner: ThreatScanner::new(),
            rate_limiter: Arc::new(RateLimiter::new()),
            audit,
            sandboxes: DashMap::new(),
            default_limits: ResourceLimits::default(),
        }
    }

    /// Replace the scanner.
    #[must_use]
    pub fn with_scanner(mut self, scanner: ThreatScanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Set the limits used when a sandbox is created without explicit ones.
    #[must_use]
    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Default resource limits.
    #[must_use]
    pub fn default_limits(&self) -> ResourceLimits {
        self.default_limits
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Create (or replace) the sandbox for `plugin`.
    pub fn create_sandbox(
        &self,
        plugin: &str,
        permissions: PermissionSet,
        limits: Option<ResourceLimits>,
    ) -> Arc<PluginSandbox> {
        let limits = limits.unwrap_or(self.default_limits);
        let sandbox = Arc::new(PluginSandbox::new(
            plugin,
            permissions,
            limits,
            Arc::clone(&self.rate_limiter),
            Arc::clone(&self.audit),
        ));
        if self
            .sandboxes
            .insert(plugin.to_owned(), Arc::clone(&sandbox))
            .is_some()
        {
            debug!(plugin, "Replaced existing sandbox");
        }
        self.audit.record(
            AuditEvent::new(plugin, AuditEventKind::SandboxLifecycle)
                .with_action("create")
                .with_metadata("cpu_seconds", limits.cpu_seconds)
                .with_metadata("memory_bytes", limits.memory_bytes),
        );
        info!(plugin, "Created sandbox");
        sandbox
    }

    /// The live sandbox for `plugin`, if any.
    #[must_use]
    pub fn sandbox(&self, plugin: &str) -> Option<Arc<PluginSandbox>> {
        self.sandboxes.get(plugin).map(|s| Arc::clone(s.value()))
    }

    /// Tear down the sandbox for `plugin` and forget its rate windows.
    /// Returns whether a sandbox existed.
    pub fn destroy_sandbox(&self, plugin: &str) -> bool {
        let existed = self.sandboxes.remove(plugin).is_some();
        self.rate_limiter.reset_plugin(plugin);
        if existed {
            self.audit.record(
                AuditEvent::new(plugin, AuditEventKind::SandboxLifecycle).with_action("destroy"),
            );
            info!(plugin, "Destroyed sandbox");
        }
        existed
    }

    /// Number of live sandboxes.
    #[must_use]
    pub fn sandbox_count(&self) -> usize {
        self.sandboxes.len()
    }

    /// Scan plugin source and audit the result.
    pub fn scan_code(&self, plugin: &str, source: &str) -> ScanReport {
        let report = self.scanner.scan(source);
        let severity = report.highest.unwrap_or(Severity::Info);
        for threat in &report.threats {
            if threat.severity >= Severity::Medium {
                warn!(
                    plugin,
                    rule = %threat.rule,
                    severity = %threat.severity,
                    line = threat.line,
                    "Threat pattern found in plugin source"
                );
            }
        }
        self.audit.record(
            AuditEvent::new(plugin, AuditEventKind::ThreatScan)
                .with_action(if report.safe { "pass" } else { "block" })
                .with_severity(severity)
                .with_metadata("threats", report.threats.len()),
        );
        report
    }

    /// Scan plugin source and refuse it if anything critical was found.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::ThreatDetected`] carrying the blocking threats.
    pub fn ensure_safe(&self, plugin: &str, source: &str) -> SandboxResult<ScanReport> {
        let report = self.scan_code(plugin, source);
        if report.safe {
            Ok(report)
        } else {
            Err(SandboxError::ThreatDetected {
                plugin: plugin.to_owned(),
                threats: report.blocking(),
            })
        }
    }

    /// Check a permission against the plugin's live sandbox.
    ///
    /// Plugins without a sandbox hold no permissions.
    #[must_use]
    pub fn check_permission(&self, plugin: &str, permission: &str) -> bool {
        if let Some(sandbox) = self.sandbox(plugin) {
            return sandbox.check_permission(permission);
        }
        self.audit.record(
            AuditEvent::new(plugin, AuditEventKind::PermissionCheck)
                .with_resource(permission)
                .with_action("denied")
                .with_severity(Severity::Medium)
                .with_metadata("reason", "no sandbox"),
        );
        false
    }

    /// Check and record one call against an arbitrary rate limit.
    pub fn check_rate_limit(&self, plugin: &str, resource: &str, limit: RateLimit) -> RateLimitResult {
        let result = self.rate_limiter.check(plugin, resource, limit);
        if let RateLimitResult::Denied { retry_after } = result {
            self.audit.record(
                AuditEvent::new(plugin, AuditEventKind::RateLimited)
                    .with_resource(resource)
                    .with_severity(Severity::Medium)
                    .with_metadata(
                        "retry_after_ms",
                        u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    ),
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabula_audit::AuditFilter;

    #[test]
    fn test_sandbox_lifecycle() {
        let service = SecurityService::default();
        let perms: PermissionSet = ["network"].into_iter().collect();
        let sandbox = service.create_sandbox("geo", perms, None);
        assert_eq!(sandbox.limits(), &ResourceLimits::default());
        assert_eq!(service.sandbox_count(), 1);
        assert!(service.check_permission("geo", "network"));
        assert!(!service.check_permission("geo", "database"));

        assert!(service.destroy_sandbox("geo"));
        assert!(!service.destroy_sandbox("geo"));
        assert!(!service.check_permission("geo", "network"));
    }

    #[test]
    fn test_scan_code_audits() {
        let service = SecurityService::default();
        let report = service.scan_code("evil", "require('child_process').exec('ls')");
        assert!(!report.safe);

        let scans = service
            .audit()
            .query(&AuditFilter::for_plugin("evil").with_kind(AuditEventKind::ThreatScan));
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].severity, Severity::Critical);
        assert_eq!(scans[0].action.as_deref(), Some("block"));
    }

    #[test]
    fn test_ensure_safe() {
        let service = SecurityService::default();
        assert!(service.ensure_safe("geo", "fetch('https://a')").is_ok());
        let err = service.ensure_safe("evil", "eval(x)").unwrap_err();
        match err {
            SandboxError::ThreatDetected { plugin, threats } => {
                assert_eq!(plugin, "evil");
                assert_eq!(threats.len(), 1);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_rate_limit_boundary() {
        let service = SecurityService::default();
        let limit = RateLimit::new(3, Duration::from_secs(60));
        let allowed: Vec<bool> = (0..4)
            .map(|_| service.check_rate_limit("geo", "api", limit).is_allowed())
            .collect();
        assert_eq!(allowed, vec![true, true, true, false]);
        assert_eq!(
            service
                .audit()
                .query(&AuditFilter::default().with_kind(AuditEventKind::RateLimited))
                .len(),
            1
        );
    }

    #[test]
    fn test_default_limits_applied() {
        let service =
            SecurityService::default().with_default_limits(ResourceLimits::strict());
        let sandbox = service.create_sandbox("geo", PermissionSet::new(), None);
        assert_eq!(sandbox.limits(), &ResourceLimits::strict());
    }
}
