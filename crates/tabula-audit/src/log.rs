//! The bounded in-memory audit log.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::{AuditError, AuditResult};
use crate::event::{AuditEvent, AuditEventKind, Severity};

/// Default number of events retained.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default retention window in days.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// Filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only events for this plugin.
    pub plugin_name: Option<String>,
    /// Only events of this kind.
    pub kind: Option<AuditEventKind>,
    /// Only events at or above this severity.
    pub min_severity: Option<Severity>,
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    /// Match events for one plugin.
    #[must_use]
    pub fn for_plugin(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: Some(plugin_name.into()),
            ..Self::default()
        }
    }

    /// Restrict to one kind.
    #[must_use]
    pub fn with_kind(mut self, kind: AuditEventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to a minimum severity.
    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Restrict to events at or after `since`.
    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        self.plugin_name
            .as_deref()
            .is_none_or(|name| event.plugin_name == name)
            && self.kind.is_none_or(|kind| event.kind == kind)
            && self.min_severity.is_none_or(|min| event.severity >= min)
            && self.since.is_none_or(|since| event.timestamp >= since)
    }
}

/// Append-only ring buffer of [`AuditEvent`]s, bounded by count and age.
///
/// Recording never blocks on I/O and never fails the caller. If the
/// internal lock is poisoned the event is dropped with a warning.
#[derive(Debug)]
pub struct AuditLog {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    max_age: Duration,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::days(DEFAULT_MAX_AGE_DAYS))
    }
}

impl AuditLog {
    /// Create a log with the given bounds. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            max_age,
        }
    }

    /// Maximum number of retained events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retention window.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Append an event, evicting the oldest entries past the bounds.
    pub fn record(&self, event: AuditEvent) {
        if event.severity >= Severity::High {
            warn!(
                plugin = %event.plugin_name,
                kind = %event.kind,
                severity = %event.severity,
                resource = event.resource.as_deref().unwrap_or(""),
                "Audit"
            );
        } else {
            debug!(
                plugin = %event.plugin_name,
                kind = %event.kind,
                severity = %event.severity,
                "Audit"
            );
        }

        let Ok(mut events) = self.events.lock() else {
            warn!(plugin = %event.plugin_name, "Audit log lock poisoned, dropping event");
            return;
        };

        let cutoff = event.timestamp.checked_sub_signed(self.max_age);
        evict_older_than(&mut events, cutoff);
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Drop events older than the retention window. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let Ok(mut events) = self.events.lock() else {
            return 0;
        };
        let before = events.len();
        evict_older_than(&mut events, Utc::now().checked_sub_signed(self.max_age));
        before.saturating_sub(events.len())
    }

    /// Events matching `filter`, oldest first.
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| filter.matches(e)).cloned().collect())
            .unwrap_or_default()
    }

    /// The `n` most recent events, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| {
                let skip = events.len().saturating_sub(n);
                events.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every event.
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Write all retained events to `path` as JSON lines.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the file cannot be written, or
    /// [`AuditError::SerializationError`] if an event fails to encode.
    pub fn export_jsonl(&self, path: &Path) -> AuditResult<usize> {
        let snapshot = self.query(&AuditFilter::default());
        let io_err = |source| AuditError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = std::fs::File::create(path).map_err(io_err)?;
        let mut writer = std::io::BufWriter::new(file);
        for event in &snapshot {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n").map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(snapshot.len())
    }
}

fn evict_older_than(events: &mut VecDeque<AuditEvent>, cutoff: Option<DateTime<Utc>>) {
    let Some(cutoff) = cutoff else {
        return;
    };
    while events.front().is_some_and(|e| e.timestamp < cutoff) {
        events.pop_front();
    }
}
