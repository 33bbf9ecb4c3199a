//! WASM execution units backed by Extism.
//!
//! The module is instantiated with the sandbox's memory ceiling and
//! execution timeout, and with WASI enabled but no host functions beyond
//! what the sandbox exposes. Calls run on the blocking pool.

use std::sync::{Arc, Mutex};

use extism::{Manifest, PluginBuilder, Wasm};
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};
use crate::limits::ResourceLimits;

const WASM_PAGE_BYTES: u64 = 64 * 1024;

/// An instantiated WASM module owned by one plugin.
pub struct WasmModule {
    plugin_name: String,
    inner: Arc<Mutex<extism::Plugin>>,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("plugin_name", &self.plugin_name)
            .finish_non_exhaustive()
    }
}

impl WasmModule {
    /// Instantiate `bytes` under `limits`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Execution`] if the module fails to compile or
    /// instantiate.
    pub fn load(plugin_name: &str, bytes: Vec<u8>, limits: &ResourceLimits) -> SandboxResult<Self> {
        let pages = limits.memory_bytes / WASM_PAGE_BYTES;
        let max_pages = u32::try_from(pages).unwrap_or(u32::MAX);
        let manifest = Manifest::new([Wasm::data(bytes)])
            .with_timeout(limits.execution_timeout())
            .with_memory_max(max_pages);

        let plugin = PluginBuilder::new(manifest)
            .with_wasi(true)
            .build()
            .map_err(|e| SandboxError::Execution {
                plugin: plugin_name.to_owned(),
                message: format!("failed to build WASM module: {e}"),
            })?;
        debug!(plugin = plugin_name, max_pages, "Instantiated WASM module");

        Ok(Self {
            plugin_name: plugin_name.to_owned(),
            inner: Arc::new(Mutex::new(plugin)),
        })
    }

    /// Whether the module exports `function`.
    #[must_use]
    pub fn exports(&self, function: &str) -> bool {
        self.inner
            .lock()
            .is_ok_and(|plugin| plugin.function_exists(function))
    }

    /// Call `function` with a UTF-8 payload and return its UTF-8 output.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Execution`] if the guest traps, times out
    /// inside Extism, or returns invalid UTF-8.
    pub async fn call(&self, function: &str, input: String) -> SandboxResult<String> {
        let inner = Arc::clone(&self.inner);
        let function = function.to_owned();
        let plugin_name = self.plugin_name.clone();
        let exec_err = move |message: String| SandboxError::Execution {
            plugin: plugin_name.clone(),
            message,
        };

        tokio::task::spawn_blocking(move || {
            let mut plugin = inner
                .lock()
                .map_err(|e| format!("WASM module lock poisoned: {e}"))?;
            plugin
                .call::<&str, String>(&function, &input)
                .map_err(|e| format!("{function} failed: {e}"))
        })
        .await
        .map_err(|e| exec_err(format!("WASM call task failed: {e}")))?
        .map_err(exec_err)
    }
}
