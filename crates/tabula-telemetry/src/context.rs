//! Operation context for correlating lifecycle work across log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation data carried through one host operation.
///
/// A lifecycle call such as an update spawns child operations (the internal
/// disable and enable); children share the parent's `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// Unique operation identifier.
    pub operation_id: Uuid,
    /// Shared by an operation and all of its children.
    pub correlation_id: Uuid,
    /// Parent operation, for child contexts.
    pub parent_id: Option<Uuid>,
    /// Component that started the operation.
    pub source: String,
    /// Operation name (`enable`, `update`, ...).
    pub operation: Option<String>,
    /// Plugin the operation concerns.
    pub plugin: Option<String>,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
}

impl OperationContext {
    /// Create a root context.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            operation_id: id,
            correlation_id: id,
            parent_id: None,
            source: source.into(),
            operation: None,
            plugin: None,
            started_at: Utc::now(),
        }
    }

    /// Create a child context that inherits the correlation id and plugin.
    #[must_use]
    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            parent_id: Some(self.operation_id),
            source: self.source.clone(),
            operation: Some(operation.into()),
            plugin: self.plugin.clone(),
            started_at: Utc::now(),
        }
    }

    /// Set the operation name.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set the plugin.
    #[must_use]
    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Milliseconds since the operation started.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// A tracing span carrying this context.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "operation",
            operation_id = %self.operation_id,
            correlation_id = %self.correlation_id,
            parent_id = self.parent_id.map(tracing::field::display),
            source = %self.source,
            operation = self.operation.as_deref(),
            plugin = self.plugin.as_deref(),
        )
    }
}
