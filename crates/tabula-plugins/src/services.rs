//! Host services offered to activated plugins.
//!
//! The host decides which services exist; a plugin sees only the ones
//! injected into its [`PluginContext`](crate::context::PluginContext).
//! Concrete routing, storage and queueing backends live outside this crate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::PluginResult;

/// Lets a plugin expose HTTP routes through the host's router.
#[async_trait]
pub trait RouteRegistrar: Send + Sync + fmt::Debug {
    /// Register `method path` for `plugin`; the host prefixes the path.
    async fn register_route(&self, plugin: &str, method: &str, path: &str) -> PluginResult<()>;

    /// Drop every route owned by `plugin`.
    async fn remove_routes(&self, plugin: &str) -> PluginResult<()>;
}

/// Durable key-value storage.
#[async_trait]
pub trait StorageService: Send + Sync + fmt::Debug {
    /// Read a key.
    async fn get(&self, key: &str) -> PluginResult<Option<Value>>;
    /// Write a key.
    async fn set(&self, key: &str, value: Value) -> PluginResult<()>;
    /// Delete a key, returning whether it existed.
    async fn delete(&self, key: &str) -> PluginResult<bool>;
}

/// Expiring cache.
#[async_trait]
pub trait CacheService: Send + Sync + fmt::Debug {
    /// Read a live entry.
    async fn get(&self, key: &str) -> PluginResult<Option<Value>>;
    /// Write an entry that expires after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> PluginResult<()>;
    /// Drop an entry.
    async fn invalidate(&self, key: &str) -> PluginResult<()>;
}

/// Background job queue.
#[async_trait]
pub trait QueueService: Send + Sync + fmt::Debug {
    /// Enqueue a job on `queue`, returning its id.
    async fn enqueue(&self, queue: &str, payload: Value) -> PluginResult<String>;
}

/// Outbound notifications to users.
#[async_trait]
pub trait NotificationService: Send + Sync + fmt::Debug {
    /// Notify `recipient`.
    async fn notify(&self, recipient: &str, message: &str) -> PluginResult<()>;
}

/// The set of services the host offers. Every service is optional.
#[derive(Debug, Clone, Default)]
pub struct HostServices {
    /// HTTP route registration.
    pub routes: Option<Arc<dyn RouteRegistrar>>,
    /// Key-value storage.
    pub storage: Option<Arc<dyn StorageService>>,
    /// Cache.
    pub cache: Option<Arc<dyn CacheService>>,
    /// Job queue.
    pub queue: Option<Arc<dyn QueueService>>,
    /// Notifications.
    pub notifications: Option<Arc<dyn NotificationService>>,
}

impl HostServices {
    /// No services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a route registrar.
    #[must_use]
    pub fn with_routes(mut self, routes: Arc<dyn RouteRegistrar>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Offer storage.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Offer a cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Offer a queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn QueueService>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Offer notifications.
    #[must_use]
    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationService>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Storage and cache backed by one [`MemoryStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new()
            .with_storage(Arc::clone(&store) as Arc<dyn StorageService>)
            .with_cache(store)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory storage and cache for tests and embedded hosts.
///
/// Storage keys and cache keys share one map; cache entries carry an
/// expiry measured on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until touched.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn live(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {},
            }
        }
        self.entries.write().await.remove(key);
        None
    }
}

#[async_trait]
impl StorageService for MemoryStore {
    async fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        Ok(self.live(key).await)
    }

    async fn set(&self, key: &str, value: Value) -> PluginResult<()> {
        self.entries.write().await.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> PluginResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

#[async_trait]
impl CacheService for MemoryStore {
    async fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        Ok(self.live(key).await)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> PluginResult<()> {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries
            .write()
            .await
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> PluginResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
