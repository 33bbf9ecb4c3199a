//! Executable plugin units and the factories that create them.
//!
//! A unit is the code half of a plugin. Activation hands back the typed
//! capability handlers the unit implements; the manager wraps them in the
//! plugin's sandbox and registers them. Purely declarative plugins have no
//! unit at all.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::capability::Capability;
use crate::context::PluginContext;
use crate::error::{PluginError, PluginResult};
use crate::handler::{CapabilityHandler, CapabilityImplementation};
use crate::manifest::{EntryKind, PluginManifest};

/// The executable part of a plugin.
#[async_trait]
pub trait PluginUnit: Send + Sync + fmt::Debug {
    /// Source text to run through the threat scanner before activation.
    /// Units without inspectable source return `None`.
    fn source(&self) -> Option<&str> {
        None
    }

    /// Start the unit and return its capability handlers.
    async fn activate(
        &mut self,
        ctx: &PluginContext,
    ) -> PluginResult<Vec<CapabilityImplementation>>;

    /// Stop the unit.
    async fn deactivate(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

/// Creates units for one [`EntryKind`].
pub trait UnitFactory: Send + Sync + fmt::Debug {
    /// Entry kind this factory handles.
    fn kind(&self) -> EntryKind;

    /// Create a unit for `manifest`, whose files live in `plugin_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit cannot be created.
    fn create(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
    ) -> PluginResult<Box<dyn PluginUnit>>;
}

/// Verify `bytes` against a declared blake3 hex digest.
///
/// # Errors
///
/// - [`PluginError::HashMismatch`] if the digest differs
/// - [`PluginError::Activation`] if no digest is declared and
///   `require_hash` is set
pub fn verify_hash(
    plugin: &str,
    bytes: &[u8],
    expected: Option<&str>,
    require_hash: bool,
) -> PluginResult<()> {
    let Some(expected) = expected else {
        if require_hash {
            return Err(PluginError::Activation {
                plugin: plugin.to_owned(),
                message: "artifact hash is required but the manifest declares none".to_owned(),
            });
        }
        return Ok(());
    };
    let actual = blake3::hash(bytes).to_hex().to_string();
    if actual.eq_ignore_ascii_case(expected.trim()) {
        debug!(plugin, "Artifact hash verified");
        Ok(())
    } else {
        Err(PluginError::HashMismatch {
            plugin: plugin.to_owned(),
            expected: expected.to_owned(),
            actual,
        })
    }
}

/// A unit made of ready-built handlers, optionally carrying source text for
/// the scanner. Native plugins are usually one of these.
#[derive(Debug, Clone, Default)]
pub struct HandlerUnit {
    source: Option<String>,
    handlers: Vec<CapabilityImplementation>,
}

impl HandlerUnit {
    /// An empty unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach source text for the pre-activation scan.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add a handler for `capability`.
    #[must_use]
    pub fn with_handler(
        mut self,
        capability: Capability,
        handler: impl CapabilityHandler + 'static,
    ) -> Self {
        self.handlers
            .push(CapabilityImplementation::new(capability, handler));
        self
    }
}

#[async_trait]
impl PluginUnit for HandlerUnit {
    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    async fn activate(
        &mut self,
        _ctx: &PluginContext,
    ) -> PluginResult<Vec<CapabilityImplementation>> {
        Ok(self.handlers.clone())
    }
}

type Constructor = dyn Fn(&PluginManifest) -> Box<dyn PluginUnit> + Send + Sync;

/// Factory for units compiled into the host, looked up by plugin name.
#[derive(Default)]
pub struct NativeUnitFactory {
    constructors: HashMap<String, Arc<Constructor>>,
}

impl fmt::Debug for NativeUnitFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("NativeUnitFactory")
            .field("plugins", &names)
            .finish()
    }
}

impl NativeUnitFactory {
    /// An empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `plugin`.
    #[must_use]
    pub fn with_unit<F>(mut self, plugin: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&PluginManifest) -> Box<dyn PluginUnit> + Send + Sync + 'static,
    {
        self.constructors
            .insert(plugin.into(), Arc::new(constructor));
        self
    }
}

impl UnitFactory for NativeUnitFactory {
    fn kind(&self) -> EntryKind {
        EntryKind::Native
    }

    fn create(
        &self,
        manifest: &PluginManifest,
        _plugin_dir: &Path,
    ) -> PluginResult<Box<dyn PluginUnit>> {
        let constructor = self
            .constructors
            .get(&manifest.name)
            .ok_or_else(|| PluginError::Activation {
                plugin: manifest.name.clone(),
                message: "no native unit is compiled into this host".to_owned(),
            })?;
        Ok(constructor(manifest))
    }
}

#[cfg(feature = "wasm")]
pub use wasm::{WasmUnit, WasmUnitFactory};

#[cfg(feature = "wasm")]
mod wasm {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tabula_sandbox::WasmModule;
    use tracing::{debug, info};

    use super::{PluginUnit, UnitFactory, verify_hash};
    use crate::capability::Capability;
    use crate::context::PluginContext;
    use crate::error::{PluginError, PluginResult};
    use crate::handler::{CapabilityHandler, CapabilityImplementation, CapabilityRequest};
    use crate::manifest::{EntryKind, PluginManifest};
    use crate::validate::extract_capabilities;

    /// Creates [`WasmUnit`]s from `entry.path`, verifying the blake3 hash.
    #[derive(Debug, Clone, Default)]
    pub struct WasmUnitFactory {
        require_hash: bool,
    }

    impl WasmUnitFactory {
        /// Create a factory; with `require_hash` set, modules without a
        /// declared hash are refused.
        #[must_use]
        pub fn new(require_hash: bool) -> Self {
            Self { require_hash }
        }
    }

    impl UnitFactory for WasmUnitFactory {
        fn kind(&self) -> EntryKind {
            EntryKind::Wasm
        }

        fn create(
            &self,
            manifest: &PluginManifest,
            plugin_dir: &Path,
        ) -> PluginResult<Box<dyn PluginUnit>> {
            let entry = manifest.entry.as_ref().ok_or_else(|| PluginError::Activation {
                plugin: manifest.name.clone(),
                message: "manifest has no entry".to_owned(),
            })?;
            let path = entry.path.as_ref().ok_or_else(|| PluginError::Activation {
                plugin: manifest.name.clone(),
                message: "wasm entry requires a path".to_owned(),
            })?;
            let bytes = std::fs::read(plugin_dir.join(path))?;
            verify_hash(&manifest.name, &bytes, entry.hash.as_deref(), self.require_hash)?;
            debug!(plugin = %manifest.name, bytes = bytes.len(), "Read WASM module");
            Ok(Box::new(WasmUnit {
                plugin: manifest.name.clone(),
                capabilities: extract_capabilities(manifest),
                bytes,
                module: None,
            }))
        }
    }

    /// A plugin compiled to WASM and run through Extism.
    ///
    /// Each claimed capability is served by the export of the same name
    /// with hyphens replaced by underscores (`field-type` → `field_type`).
    /// Optional `activate` and `deactivate` exports are called on the
    /// lifecycle transitions.
    #[derive(Debug)]
    pub struct WasmUnit {
        plugin: String,
        capabilities: Vec<Capability>,
        bytes: Vec<u8>,
        module: Option<Arc<WasmModule>>,
    }

    #[async_trait]
    impl PluginUnit for WasmUnit {
        async fn activate(
            &mut self,
            ctx: &PluginContext,
        ) -> PluginResult<Vec<CapabilityImplementation>> {
            let module = Arc::new(WasmModule::load(
                &self.plugin,
                self.bytes.clone(),
                ctx.sandbox.limits(),
            )?);
            if module.exports("activate") {
                let config = Value::Object(ctx.config.clone()).to_string();
                module.call("activate", config).await?;
            }

            let mut implementations = Vec::new();
            for &capability in &self.capabilities {
                let function = capability.as_str().replace('-', "_");
                if module.exports(&function) {
                    implementations.push(CapabilityImplementation::new(
                        capability,
                        WasmHandler {
                            plugin: self.plugin.clone(),
                            module: Arc::clone(&module),
                            function,
                        },
                    ));
                }
            }
            info!(
                plugin = %self.plugin,
                handlers = implementations.len(),
                "WASM unit activated"
            );
            self.module = Some(module);
            Ok(implementations)
        }

        async fn deactivate(&mut self) -> PluginResult<()> {
            if let Some(module) = self.module.take()
                && module.exports("deactivate")
            {
                module.call("deactivate", String::new()).await?;
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct WasmHandler {
        plugin: String,
        module: Arc<WasmModule>,
        function: String,
    }

    #[async_trait]
    impl CapabilityHandler for WasmHandler {
        async fn invoke(&self, request: CapabilityRequest) -> PluginResult<Value> {
            let input = serde_json::to_string(&request).map_err(|e| PluginError::Activation {
                plugin: self.plugin.clone(),
                message: format!("request is not serializable: {e}"),
            })?;
            let output = self.module.call(&self.function, input).await?;
            Ok(serde_json::from_str(&output).unwrap_or(Value::String(output)))
        }
    }
}
