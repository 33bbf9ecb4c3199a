//! Audit event types.
//!
//! Every security-relevant decision the host makes about a plugin is
//! recorded as an [`AuditEvent`]: permission checks, host API access,
//! capability (un)registration, resource violations, threat scans and
//! rate-limit refusals.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity attached to audit events and threat findings.
///
/// Ordered from least to most severe so `>=` comparisons express
/// "at least this bad".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine, expected activity.
    Info,
    /// Worth noting, no action needed.
    Low,
    /// Suspicious but tolerated.
    Medium,
    /// Dangerous; allowed only because policy does not block it.
    High,
    /// Blocks execution.
    Critical,
}

impl Severity {
    /// Returns true if this severity blocks execution.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        self == Self::Critical
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What kind of decision or activity an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A permission was checked (granted or denied).
    PermissionCheck,
    /// A plugin called a host API (network, database, timers).
    ApiAccess,
    /// A capability implementation was registered.
    CapabilityRegistered,
    /// A capability implementation was removed.
    CapabilityUnregistered,
    /// A plugin exceeded a resource limit.
    ResourceViolation,
    /// Plugin source was scanned for threats.
    ThreatScan,
    /// A rate-limited call was refused.
    RateLimited,
    /// A sandbox was created or destroyed.
    SandboxLifecycle,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PermissionCheck => "permission_check",
            Self::ApiAccess => "api_access",
            Self::CapabilityRegistered => "capability_registered",
            Self::CapabilityUnregistered => "capability_unregistered",
            Self::ResourceViolation => "resource_violation",
            Self::ThreatScan => "threat_scan",
            Self::RateLimited => "rate_limited",
            Self::SandboxLifecycle => "sandbox_lifecycle",
        };
        f.write_str(s)
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Plugin the event concerns.
    pub plugin_name: String,
    /// Event kind.
    pub kind: AuditEventKind,
    /// Resource touched, if any (e.g. `network`, a capability name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Action attempted on the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub severity: Severity,
    /// Free-form structured detail.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    /// Create an `info` event stamped with the current time.
    #[must_use]
    pub fn new(plugin_name: impl Into<String>, kind: AuditEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_name: plugin_name.into(),
            kind,
            resource: None,
            action: None,
            timestamp: Utc::now(),
            severity: Severity::Info,
            metadata: serde_json::Map::new(),
        }
    }

    /// Set the resource.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a metadata field.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::Info);
        assert!(Severity::Critical.is_blocking());
        assert!(!Severity::High.is_blocking());
    }

    #[test]
    fn test_event_builder() {
        let event = AuditEvent::new("geo", AuditEventKind::ApiAccess)
            .with_resource("network")
            .with_action("fetch")
            .with_severity(Severity::Low)
            .with_metadata("target", "tiles.example.com");

        assert_eq!(event.plugin_name, "geo");
        assert_eq!(event.resource.as_deref(), Some("network"));
        assert_eq!(event.action.as_deref(), Some("fetch"));
        assert_eq!(event.severity, Severity::Low);
        assert_eq!(event.metadata["target"], "tiles.example.com");
    }

    #[test]
    fn test_event_serialization_omits_empty_fields() {
        let event = AuditEvent::new("geo", AuditEventKind::ThreatScan);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"threat_scan\""));
        assert!(!json.contains("resource"));
        assert!(!json.contains("metadata"));
    }
}
