//! Lifecycle events and the broadcast bus that carries them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default channel capacity for the lifecycle bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Identity and time of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event id.
    pub id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl EventMetadata {
    /// Fresh metadata stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A plugin lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A plugin was registered.
    Installed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name.
        plugin: String,
        /// Installed version.
        version: String,
    },
    /// A plugin's manifest was replaced by a newer version.
    Updated {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name.
        plugin: String,
        /// Previous version.
        from_version: String,
        /// New version.
        to_version: String,
    },
    /// A plugin was activated.
    Enabled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name.
        plugin: String,
    },
    /// A plugin was deactivated.
    Disabled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name.
        plugin: String,
    },
    /// A plugin was removed.
    Uninstalled {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name.
        plugin: String,
    },
    /// A lifecycle operation failed and the plugin moved to `error`.
    Error {
        /// Event metadata.
        metadata: EventMetadata,
        /// Plugin name.
        plugin: String,
        /// Failure message.
        message: String,
    },
}

impl LifecycleEvent {
    /// Snake-case event type.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Installed { .. } => "installed",
            Self::Updated { .. } => "updated",
            Self::Enabled { .. } => "enabled",
            Self::Disabled { .. } => "disabled",
            Self::Uninstalled { .. } => "uninstalled",
            Self::Error { .. } => "error",
        }
    }

    /// Plugin the event concerns.
    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::Installed { plugin, .. }
            | Self::Updated { plugin, .. }
            | Self::Enabled { plugin, .. }
            | Self::Disabled { plugin, .. }
            | Self::Uninstalled { plugin, .. }
            | Self::Error { plugin, .. } => plugin,
        }
    }

    /// Event metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::Installed { metadata, .. }
            | Self::Updated { metadata, .. }
            | Self::Enabled { metadata, .. }
            | Self::Disabled { metadata, .. }
            | Self::Uninstalled { metadata, .. }
            | Self::Error { metadata, .. } => metadata,
        }
    }

    pub(crate) fn installed(plugin: &str, version: &str) -> Self {
        Self::Installed {
            metadata: EventMetadata::new(),
            plugin: plugin.to_owned(),
            version: version.to_owned(),
        }
    }

    pub(crate) fn updated(plugin: &str, from_version: &str, to_version: &str) -> Self {
        Self::Updated {
            metadata: EventMetadata::new(),
            plugin: plugin.to_owned(),
            from_version: from_version.to_owned(),
            to_version: to_version.to_owned(),
        }
    }

    pub(crate) fn enabled(plugin: &str) -> Self {
        Self::Enabled {
            metadata: EventMetadata::new(),
            plugin: plugin.to_owned(),
        }
    }

    pub(crate) fn disabled(plugin: &str) -> Self {
        Self::Disabled {
            metadata: EventMetadata::new(),
            plugin: plugin.to_owned(),
        }
    }

    pub(crate) fn uninstalled(plugin: &str) -> Self {
        Self::Uninstalled {
            metadata: EventMetadata::new(),
            plugin: plugin.to_owned(),
        }
    }

    pub(crate) fn error(plugin: &str, message: impl Into<String>) -> Self {
        Self::Error {
            metadata: EventMetadata::new(),
            plugin: plugin.to_owned(),
            message: message.into(),
        }
    }
}

/// Broadcasts lifecycle events to every subscriber.
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    sender: broadcast::Sender<Arc<LifecycleEvent>>,
    capacity: usize,
}

impl LifecycleBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with the given capacity (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event. Returns the number of receivers it reached; having
    /// none is not an error.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let event = Arc::new(event);
        if let Ok(count) = self.sender.send(Arc::clone(&event)) {
            debug!(
                event_type = event.event_type(),
                plugin = %event.plugin(),
                receiver_count = count,
                "Lifecycle event published"
            );
            count
        } else {
            trace!(event_type = event.event_type(), "No receivers for lifecycle event");
            0
        }
    }

    /// Subscribe to every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> LifecycleReceiver {
        LifecycleReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`LifecycleBus`] subscription.
#[derive(Debug)]
pub struct LifecycleReceiver {
    receiver: broadcast::Receiver<Arc<LifecycleEvent>>,
}

impl LifecycleReceiver {
    /// Wait for the next event. A lagging receiver skips what it missed and
    /// keeps going. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Arc<LifecycleEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Lifecycle receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<LifecycleEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Lifecycle receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}
