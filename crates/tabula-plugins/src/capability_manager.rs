//! Capability manager: who implements what, and in which order.
//!
//! For every capability the manager keeps the live implementations sorted
//! by priority (highest first), breaking ties by registration sequence so
//! the first registered wins. The ordering is deterministic for any
//! sequence of registrations.
//!
//! The manager is internally synchronized and shared behind an `Arc`.
//! Invocation clones the handlers out of the lock before awaiting, so no
//! lock is ever held across plugin code.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tabula_audit::{AuditEvent, AuditEventKind, AuditLog};
use tracing::{debug, info};

use crate::capability::Capability;
use crate::error::{PluginError, PluginResult};
use crate::handler::{CapabilityImplementation, CapabilityRequest};

/// One plugin's implementation of one capability.
#[derive(Debug, Clone)]
pub struct CapabilityRegistration {
    /// Implementing plugin.
    pub plugin: String,
    /// Implemented capability.
    pub capability: Capability,
    /// The handler.
    pub implementation: CapabilityImplementation,
    /// Ordering priority; higher wins.
    pub priority: i32,
    /// When the implementation was registered.
    pub registered_at: DateTime<Utc>,
    /// Global registration sequence, used to break priority ties.
    pub sequence: u64,
}

/// Result of one implementation during a [`CapabilityManager::broadcast`].
#[derive(Debug)]
pub struct BroadcastOutcome {
    /// Implementing plugin.
    pub plugin: String,
    /// What it returned.
    pub result: PluginResult<Value>,
}

#[derive(Debug, Default)]
struct Inner {
    by_capability: BTreeMap<Capability, Vec<CapabilityRegistration>>,
    next_sequence: u64,
}

/// Tracks live capability implementations.
#[derive(Debug, Default)]
pub struct CapabilityManager {
    inner: RwLock<Inner>,
    audit: Option<Arc<AuditLog>>,
}

impl CapabilityManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (un)registrations in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register `plugin`'s implementation, replacing any previous one for
    /// the same capability. A replacement takes a fresh sequence number.
    pub fn register(
        &self,
        plugin: &str,
        implementation: CapabilityImplementation,
        priority: i32,
    ) {
        let capability = implementation.capability;
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let sequence = inner.next_sequence;
            inner.next_sequence = sequence.saturating_add(1);

            let list = inner.by_capability.entry(capability).or_default();
            list.retain(|r| r.plugin != plugin);
            list.push(CapabilityRegistration {
                plugin: plugin.to_owned(),
                capability,
                implementation,
                priority,
                registered_at: Utc::now(),
                sequence,
            });
            list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
        }
        debug!(plugin, capability = %capability, priority, "Capability registered");
        self.audit(plugin, AuditEventKind::CapabilityRegistered, capability);
    }

    /// Remove `plugin`'s implementation of `capability`. Returns whether
    /// one existed.
    pub fn unregister(&self, plugin: &str, capability: Capability) -> bool {
        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let Some(list) = inner.by_capability.get_mut(&capability) else {
                return false;
            };
            let before = list.len();
            list.retain(|r| r.plugin != plugin);
            let removed = list.len() != before;
            if list.is_empty() {
                inner.by_capability.remove(&capability);
            }
            removed
        };
        if removed {
            debug!(plugin, capability = %capability, "Capability unregistered");
            self.audit(plugin, AuditEventKind::CapabilityUnregistered, capability);
        }
        removed
    }

    /// Remove every implementation registered by `plugin`. Returns the
    /// capabilities that were removed.
    pub fn unregister_plugin(&self, plugin: &str) -> Vec<Capability> {
        let removed: Vec<Capability> = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut removed = Vec::new();
            inner.by_capability.retain(|cap, list| {
                let before = list.len();
                list.retain(|r| r.plugin != plugin);
                if list.len() != before {
                    removed.push(*cap);
                }
                !list.is_empty()
            });
            removed
        };
        for &cap in &removed {
            self.audit(plugin, AuditEventKind::CapabilityUnregistered, cap);
        }
        if !removed.is_empty() {
            info!(plugin, count = removed.len(), "Unregistered plugin capabilities");
        }
        removed
    }

    /// The winning implementation of `capability`.
    #[must_use]
    pub fn primary(&self, capability: Capability) -> Option<CapabilityRegistration> {
        self.read(|inner| {
            inner
                .by_capability
                .get(&capability)
                .and_then(|list| list.first().cloned())
        })
    }

    /// All implementations of `capability`, in priority order.
    #[must_use]
    pub fn implementations(&self, capability: Capability) -> Vec<CapabilityRegistration> {
        self.read(|inner| {
            inner
                .by_capability
                .get(&capability)
                .cloned()
                .unwrap_or_default()
        })
    }

    /// Plugins implementing `capability`, in priority order.
    #[must_use]
    pub fn providers(&self, capability: Capability) -> Vec<String> {
        self.read(|inner| {
            inner
                .by_capability
                .get(&capability)
                .map(|list| list.iter().map(|r| r.plugin.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Implementation count per capability.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<Capability, usize> {
        self.read(|inner| {
            inner
                .by_capability
                .iter()
                .map(|(cap, list)| (*cap, list.len()))
                .collect()
        })
    }

    /// Capabilities `plugin` currently implements.
    #[must_use]
    pub fn capabilities_of(&self, plugin: &str) -> Vec<Capability> {
        self.read(|inner| {
            inner
                .by_capability
                .iter()
                .filter(|(_, list)| list.iter().any(|r| r.plugin == plugin))
                .map(|(cap, _)| *cap)
                .collect()
        })
    }

    /// Invoke the winning implementation of `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] naming the capability when nothing
    /// implements it, otherwise whatever the handler returns.
    pub async fn invoke_primary(
        &self,
        capability: Capability,
        request: CapabilityRequest,
    ) -> PluginResult<Value> {
        let registration = self
            .primary(capability)
            .ok_or_else(|| PluginError::NotFound(format!("implementation of {capability}")))?;
        registration.implementation.invoke(request).await
    }

    /// Invoke every implementation of `capability` concurrently. Results
    /// come back in priority order; one failure does not affect the others.
    pub async fn broadcast(
        &self,
        capability: Capability,
        request: CapabilityRequest,
    ) -> Vec<BroadcastOutcome> {
        let registrations = self.implementations(capability);
        let calls = registrations.into_iter().map(|r| {
            let request = request.clone();
            async move {
                BroadcastOutcome {
                    result: r.implementation.invoke(request).await,
                    plugin: r.plugin,
                }
            }
        });
        join_all(calls).await
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }

    fn audit(&self, plugin: &str, kind: AuditEventKind, capability: Capability) {
        if let Some(audit) = &self.audit {
            audit.record(AuditEvent::new(plugin, kind).with_resource(capability.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabula_audit::AuditFilter;

    use crate::handler::FnHandler;

    fn imp(capability: Capability, tag: &'static str) -> CapabilityImplementation {
        CapabilityImplementation::new(capability, FnHandler::new(tag, move |_| Ok(json!(tag))))
    }

    #[test]
    fn test_priority_then_first_registered() {
        let mgr = CapabilityManager::new();
        mgr.register("low", imp(Capability::ViewProvider, "low"), 5);
        mgr.register("first", imp(Capability::ViewProvider, "first"), 10);
        mgr.register("second", imp(Capability::ViewProvider, "second"), 10);
        assert_eq!(
            mgr.providers(Capability::ViewProvider),
            vec!["first", "second", "low"]
        );
        assert_eq!(mgr.primary(Capability::ViewProvider).unwrap().plugin, "first");
    }

    #[test]
    fn test_order_is_independent_of_interleaving() {
        let a = CapabilityManager::new();
        a.register("x", imp(Capability::Formula, "x"), 50);
        a.register("y", imp(Capability::Formula, "y"), 60);

        let b = CapabilityManager::new();
        b.register("y", imp(Capability::Formula, "y"), 60);
        b.register("x", imp(Capability::Formula, "x"), 50);

        assert_eq!(a.providers(Capability::Formula), b.providers(Capability::Formula));
    }

    #[test]
    fn test_reregistration_replaces() {
        let mgr = CapabilityManager::new();
        mgr.register("geo", imp(Capability::FieldType, "a"), 60);
        mgr.register("other", imp(Capability::FieldType, "b"), 60);
        mgr.register("geo", imp(Capability::FieldType, "c"), 60);
        assert_eq!(mgr.providers(Capability::FieldType), vec!["other", "geo"]);
        assert_eq!(mgr.counts().get(&Capability::FieldType), Some(&2));
    }

    #[test]
    fn test_unregister() {
        let audit = Arc::new(AuditLog::default());
        let mgr = CapabilityManager::new().with_audit(Arc::clone(&audit));
        mgr.register("geo", imp(Capability::FieldType, "a"), 60);
        mgr.register("geo", imp(Capability::ViewProvider, "b"), 50);
        assert_eq!(
            mgr.capabilities_of("geo"),
            vec![Capability::ViewProvider, Capability::FieldType]
        );

        assert!(mgr.unregister("geo", Capability::FieldType));
        assert!(!mgr.unregister("geo", Capability::FieldType));
        assert_eq!(mgr.unregister_plugin("geo"), vec![Capability::ViewProvider]);
        assert!(mgr.counts().is_empty());
        assert!(mgr.primary(Capability::ViewProvider).is_none());

        let events = audit.query(&AuditFilter::for_plugin("geo"));
        assert_eq!(events.len(), 4);
        assert_eq!(
            audit
                .query(&AuditFilter::default().with_kind(AuditEventKind::CapabilityUnregistered))
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_invoke_primary_and_broadcast() {
        let mgr = CapabilityManager::new();
        mgr.register("mail", imp(Capability::NotificationChannel, "mail"), 20);
        mgr.register("chat", imp(Capability::NotificationChannel, "chat"), 30);
        mgr.register(
            "broken",
            CapabilityImplementation::new(
                Capability::NotificationChannel,
                FnHandler::new("broken", |_| {
                    Err(PluginError::Activation {
                        plugin: "broken".into(),
                        message: "down".into(),
                    })
                }),
            ),
            10,
        );

        let out = mgr
            .invoke_primary(Capability::NotificationChannel, CapabilityRequest::new("send"))
            .await
            .unwrap();
        assert_eq!(out, json!("chat"));

        let outcomes = mgr
            .broadcast(Capability::NotificationChannel, CapabilityRequest::new("send"))
            .await;
        let plugins: Vec<&str> = outcomes.iter().map(|o| o.plugin.as_str()).collect();
        assert_eq!(plugins, vec!["chat", "mail", "broken"]);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[2].result.is_err());

        let err = mgr
            .invoke_primary(Capability::Command, CapabilityRequest::new("run"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }
}
