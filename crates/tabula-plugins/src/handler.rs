//! Capability handlers.
//!
//! A handler is the typed entry point through which the host invokes one
//! capability of one plugin. Every handler a plugin hands back from
//! activation is wrapped in a [`SandboxedHandler`] before the capability
//! manager sees it, so all invocations run under the plugin's execution
//! budget.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tabula_sandbox::PluginSandbox;

use crate::capability::Capability;
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;

/// One invocation of a capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Operation name, interpreted by the handler (`render`, `evaluate`, ...).
    pub operation: String,
    /// Operation input.
    #[serde(default)]
    pub payload: Value,
}

impl CapabilityRequest {
    /// Request `operation` with a null payload.
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            payload: Value::Null,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Handles invocations of one capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync + fmt::Debug {
    /// Handle one request.
    async fn invoke(&self, request: CapabilityRequest) -> PluginResult<Value>;
}

/// A handler tagged with the capability it implements.
#[derive(Clone)]
pub struct CapabilityImplementation {
    /// Implemented capability.
    pub capability: Capability,
    /// The handler.
    pub handler: Arc<dyn CapabilityHandler>,
}

impl fmt::Debug for CapabilityImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityImplementation")
            .field("capability", &self.capability)
            .field("handler", &self.handler)
            .finish()
    }
}

impl CapabilityImplementation {
    /// Tag `handler` with `capability`.
    pub fn new(capability: Capability, handler: impl CapabilityHandler + 'static) -> Self {
        Self {
            capability,
            handler: Arc::new(handler),
        }
    }

    /// Invoke the handler.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns.
    pub async fn invoke(&self, request: CapabilityRequest) -> PluginResult<Value> {
        self.handler.invoke(request).await
    }
}

/// Default handler for plugins that contribute a capability declaratively
/// without executable code. Answers every request with the manifest's
/// contributions for that capability.
#[derive(Debug, Clone)]
pub struct ManifestHandler {
    plugin: String,
    capability: Capability,
    contributions: Value,
}

impl ManifestHandler {
    /// Build from the manifest's contribution list for `capability`.
    #[must_use]
    pub fn new(manifest: &PluginManifest, capability: Capability) -> Self {
        let contributions =
            serde_json::to_value(manifest.contributes.list(capability)).unwrap_or(Value::Null);
        Self {
            plugin: manifest.name.clone(),
            capability,
            contributions,
        }
    }
}

#[async_trait]
impl CapabilityHandler for ManifestHandler {
    async fn invoke(&self, request: CapabilityRequest) -> PluginResult<Value> {
        Ok(json!({
            "plugin": self.plugin,
            "capability": self.capability,
            "operation": request.operation,
            "contributions": self.contributions,
        }))
    }
}

/// Runs an inner handler under the plugin's sandbox timeout.
#[derive(Debug)]
pub struct SandboxedHandler {
    inner: Arc<dyn CapabilityHandler>,
    sandbox: Arc<PluginSandbox>,
}

impl SandboxedHandler {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn CapabilityHandler>, sandbox: Arc<PluginSandbox>) -> Self {
        Self { inner, sandbox }
    }
}

#[async_trait]
impl CapabilityHandler for SandboxedHandler {
    async fn invoke(&self, request: CapabilityRequest) -> PluginResult<Value> {
        let operation = request.operation.clone();
        self.sandbox
            .execute(&operation, self.inner.invoke(request))
            .await?
    }
}

type HandlerFn = dyn Fn(CapabilityRequest) -> PluginResult<Value> + Send + Sync;

/// Handler backed by a synchronous closure. Handy for native plugins with
/// trivial capabilities and for tests.
///
/// The closure runs on the blocking pool so a sandbox timeout can fire
/// while it is still running.
pub struct FnHandler {
    name: String,
    f: Arc<HandlerFn>,
}

impl FnHandler {
    /// Wrap `f`; `name` appears in debug output.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CapabilityRequest) -> PluginResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CapabilityHandler for FnHandler {
    async fn invoke(&self, request: CapabilityRequest) -> PluginResult<Value> {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f(request))
            .await
            .map_err(|e| PluginError::Handler {
                handler: self.name.clone(),
                message: e.to_string(),
            })?
    }
}
