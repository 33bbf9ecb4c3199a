//! Context handed to a plugin unit on activation.

use std::sync::Arc;

use serde_json::{Map, Value};
use tabula_sandbox::PluginSandbox;

use crate::error::{PluginError, PluginResult};
use crate::services::{HostServices, StorageService};

/// Everything an activating plugin may touch: its configuration, its
/// sandbox, and the host services.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Plugin name.
    pub plugin: String,
    /// The plugin's configuration object.
    pub config: Map<String, Value>,
    /// The plugin's sandbox. Host calls go through here.
    pub sandbox: Arc<PluginSandbox>,
    /// Host services.
    pub services: HostServices,
}

impl PluginContext {
    /// Assemble a context.
    #[must_use]
    pub fn new(
        plugin: impl Into<String>,
        config: Map<String, Value>,
        sandbox: Arc<PluginSandbox>,
        services: HostServices,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            config,
            sandbox,
            services,
        }
    }

    /// A configuration value.
    #[must_use]
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Storage scoped to this plugin, if the host offers storage.
    #[must_use]
    pub fn storage(&self) -> Option<ScopedStorage> {
        self.services
            .storage
            .as_ref()
            .map(|inner| ScopedStorage::new(Arc::clone(inner), &self.plugin))
    }
}

/// Storage whose keys are prefixed with `plugin:{name}:` so plugins cannot
/// see each other's data.
#[derive(Debug, Clone)]
pub struct ScopedStorage {
    inner: Arc<dyn StorageService>,
    namespace: String,
}

impl ScopedStorage {
    /// Scope `inner` to `plugin`.
    #[must_use]
    pub fn new(inner: Arc<dyn StorageService>, plugin: &str) -> Self {
        Self {
            inner,
            namespace: format!("plugin:{plugin}"),
        }
    }

    /// The key prefix, without the trailing separator.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, key: &str) -> PluginResult<String> {
        if key.is_empty() {
            return Err(PluginError::Activation {
                plugin: self.namespace.trim_start_matches("plugin:").to_owned(),
                message: "storage keys must not be empty".to_owned(),
            });
        }
        Ok(format!("{}:{key}", self.namespace))
    }

    /// Read a key.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty key or a backend failure.
    pub async fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        self.inner.get(&self.key(key)?).await
    }

    /// Write a key.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty key or a backend failure.
    pub async fn set(&self, key: &str, value: Value) -> PluginResult<()> {
        self.inner.set(&self.key(key)?, value).await
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty key or a backend failure.
    pub async fn delete(&self, key: &str) -> PluginResult<bool> {
        self.inner.delete(&self.key(key)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabula_sandbox::SecurityService;

    use crate::services::MemoryStore;

    #[tokio::test]
    async fn test_scoped_storage_isolates_plugins() {
        let backend = Arc::new(MemoryStore::new());
        let geo = ScopedStorage::new(Arc::clone(&backend) as Arc<dyn StorageService>, "geo");
        let calc = ScopedStorage::new(Arc::clone(&backend) as Arc<dyn StorageService>, "calc");

        geo.set("zoom", json!(4)).await.unwrap();
        assert_eq!(geo.get("zoom").await.unwrap(), Some(json!(4)));
        assert_eq!(calc.get("zoom").await.unwrap(), None);
        assert_eq!(
            StorageService::get(backend.as_ref(), "plugin:geo:zoom").await.unwrap(),
            Some(json!(4))
        );
        assert!(geo.set("", json!(1)).await.is_err());
    }

    #[test]
    fn test_context_storage_requires_service() {
        let security = SecurityService::default();
        let sandbox = security.create_sandbox("geo", Default::default(), None);
        let mut config = Map::new();
        config.insert("zoom".into(), json!(3));

        let ctx = PluginContext::new("geo", config, Arc::clone(&sandbox), HostServices::new());
        assert!(ctx.storage().is_none());
        assert_eq!(ctx.config_value("zoom"), Some(&json!(3)));

        let ctx = PluginContext::new("geo", Map::new(), sandbox, HostServices::in_memory());
        assert_eq!(ctx.storage().unwrap().namespace(), "plugin:geo");
    }
}
