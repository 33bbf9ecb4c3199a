//! Plugin manager: the host-facing façade.
//!
//! The manager composes the registry, the capability manager, the security
//! service, persistence, the lifecycle bus and the loader, and drives every
//! lifecycle transition:
//!
//! - guard failures (missing dependencies, blocking dependents, a status
//!   that does not allow the action, a version that does not increase) are
//!   returned without touching any state
//! - plugin-local failures (validation, dependencies, capabilities,
//!   permissions, scanning, activation) tear the plugin down, move it to
//!   `error` with `last_error`, and publish an `error` event
//!
//! The registry lock is never held while plugin code runs. Persistence
//! failures are logged and the manager keeps running from memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use semver::Version;
use serde_json::{Map, Value};
use tabula_audit::AuditLog;
use tabula_config::{Config, ConfigError};
use tabula_sandbox::{ResourceLimits, SecurityService};
use tabula_telemetry::OperationContext;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{Instrument, debug, info, warn};

use crate::capability::Capability;
use crate::capability_manager::{BroadcastOutcome, CapabilityManager, CapabilityRegistration};
use crate::context::PluginContext;
use crate::error::{GuardViolation, PluginError, PluginResult};
use crate::events::{LifecycleBus, LifecycleEvent, LifecycleReceiver};
use crate::graph::DependencyGraph;
use crate::handler::{
    CapabilityImplementation, CapabilityRequest, ManifestHandler, SandboxedHandler,
};
use crate::loader::PluginLoader;
use crate::manifest::PluginManifest;
use crate::persistence::{FilePersistence, MemoryPersistence, PersistenceProvider};
use crate::registration::{PluginRegistration, PluginStatus};
use crate::registry::{PluginQuery, PluginRegistry, RegisterOutcome, RegistryStats};
use crate::resolver::install_order;
use crate::services::HostServices;
use crate::unit::PluginUnit;
use crate::validate::extract_capabilities;

type SharedUnit = Arc<AsyncMutex<Box<dyn PluginUnit>>>;

/// Settings the manager is built from.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Host version manifests are checked against.
    pub host_version: Version,
    /// Directories scanned by [`PluginManager::load_from_directories`].
    pub directories: Vec<PathBuf>,
    /// Manifest file name.
    pub manifest_file: String,
    /// JSON state file. `None` keeps registrations in memory.
    pub state_file: Option<PathBuf>,
    /// Enable newly discovered plugins after loading.
    pub auto_enable: bool,
    /// Default sandbox limits.
    pub limits: ResourceLimits,
    /// Refuse WASM units without a declared hash.
    pub require_hash: bool,
    /// Audit log capacity.
    pub audit_capacity: usize,
    /// Audit log retention.
    pub audit_max_age: chrono::Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let config = Config::default();
        Self {
            host_version: Version::new(1, 0, 0),
            directories: Vec::new(),
            manifest_file: config.plugins.manifest_file,
            state_file: None,
            auto_enable: false,
            limits: ResourceLimits::default(),
            require_hash: false,
            audit_capacity: config.audit.capacity,
            audit_max_age: chrono::Duration::days(i64::from(config.audit.max_age_days)),
        }
    }
}

impl ManagerConfig {
    /// Settings for the given host version, everything else default.
    #[must_use]
    pub fn for_host(host_version: Version) -> Self {
        Self {
            host_version,
            ..Self::default()
        }
    }

    /// Bridge from the host configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the configuration does not
    /// validate.
    pub fn from_config(config: &Config) -> PluginResult<Self> {
        tabula_config::validate::validate(config)?;
        let host_version =
            Version::parse(&config.host.version).map_err(|e| ConfigError::ValidationError {
                field: "host.version".to_owned(),
                message: e.to_string(),
            })?;
        let sandbox = &config.sandbox;
        Ok(Self {
            host_version,
            directories: config.plugins.directories.clone(),
            manifest_file: config.plugins.manifest_file.clone(),
            state_file: config.plugins.state_file.clone(),
            auto_enable: config.plugins.auto_enable,
            limits: ResourceLimits {
                memory_bytes: sandbox.memory_bytes,
                cpu_seconds: sandbox.cpu_seconds,
                disk_bytes: sandbox.disk_bytes,
                network_calls_per_minute: sandbox.network_calls_per_minute,
                database_calls_per_minute: sandbox.database_calls_per_minute,
            },
            require_hash: sandbox.require_hash,
            audit_capacity: config.audit.capacity,
            audit_max_age: chrono::Duration::days(i64::from(config.audit.max_age_days)),
        })
    }

    /// A loader scanning the configured directories. With the `wasm`
    /// feature it can instantiate WASM units.
    #[must_use]
    pub fn loader(&self) -> PluginLoader {
        let loader = PluginLoader::new()
            .with_directories(self.directories.iter().cloned())
            .with_manifest_file(self.manifest_file.clone());
        with_wasm_factory(loader, self.require_hash)
    }

    /// A security service with the configured limits and audit bounds.
    #[must_use]
    pub fn security(&self) -> SecurityService {
        let audit = Arc::new(AuditLog::new(self.audit_capacity, self.audit_max_age));
        SecurityService::new(audit).with_default_limits(self.limits)
    }

    /// File persistence when a state file is configured, memory otherwise.
    #[must_use]
    pub fn persistence(&self) -> Arc<dyn PersistenceProvider> {
        match &self.state_file {
            Some(path) => Arc::new(FilePersistence::new(path)),
            None => Arc::new(MemoryPersistence::new()),
        }
    }
}

/// Builds a [`PluginManager`]. Anything not supplied is derived from the
/// [`ManagerConfig`].
#[derive(Debug)]
pub struct PluginManagerBuilder {
    config: ManagerConfig,
    security: Option<Arc<SecurityService>>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    events: Option<LifecycleBus>,
    services: HostServices,
    loader: Option<PluginLoader>,
}

impl PluginManagerBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            security: None,
            persistence: None,
            events: None,
            services: HostServices::new(),
            loader: None,
        }
    }

    /// Use a shared security service.
    #[must_use]
    pub fn with_security(mut self, security: Arc<SecurityService>) -> Self {
        self.security = Some(security);
        self
    }

    /// Use a persistence provider.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceProvider>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Publish lifecycle events on an existing bus.
    #[must_use]
    pub fn with_events(mut self, events: LifecycleBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Offer these services to activated plugins.
    #[must_use]
    pub fn with_services(mut self, services: HostServices) -> Self {
        self.services = services;
        self
    }

    /// Use a custom loader.
    #[must_use]
    pub fn with_loader(mut self, loader: PluginLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Build the manager.
    #[must_use]
    pub fn build(self) -> PluginManager {
        let security = self
            .security
            .unwrap_or_else(|| Arc::new(self.config.security()));
        let capabilities =
            Arc::new(CapabilityManager::new().with_audit(Arc::clone(security.audit())));
        let persistence = self
            .persistence
            .unwrap_or_else(|| self.config.persistence());
        let loader = self.loader.unwrap_or_else(|| self.config.loader());
        PluginManager {
            registry: RwLock::new(PluginRegistry::new(self.config.host_version.clone())),
            capabilities,
            security,
            persistence,
            persistence_degraded: AtomicBool::new(false),
            events: self.events.unwrap_or_default(),
            services: self.services,
            loader,
            units: Mutex::new(HashMap::new()),
            config: self.config,
        }
    }
}

/// Outcome of [`PluginManager::load_from_directories`] and
/// [`PluginManager::init`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Registrations restored from persistence.
    pub restored: usize,
    /// Plugins registered (or confirmed unchanged) from disk, in install
    /// order.
    pub registered: Vec<String>,
    /// Plugins that failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Plugins enabled by this call.
    pub enabled: Vec<String>,
}

/// Owns every plugin and drives their lifecycle.
#[derive(Debug)]
pub struct PluginManager {
    config: ManagerConfig,
    registry: RwLock<PluginRegistry>,
    capabilities: Arc<CapabilityManager>,
    security: Arc<SecurityService>,
    persistence: Arc<dyn PersistenceProvider>,
    persistence_degraded: AtomicBool,
    events: LifecycleBus,
    services: HostServices,
    loader: PluginLoader,
    units: Mutex<HashMap<String, SharedUnit>>,
}

#[cfg(feature = "wasm")]
fn with_wasm_factory(loader: PluginLoader, require_hash: bool) -> PluginLoader {
    loader.with_factory(crate::unit::WasmUnitFactory::new(require_hash))
}

#[cfg(not(feature = "wasm"))]
fn with_wasm_factory(loader: PluginLoader, _require_hash: bool) -> PluginLoader {
    loader
}

fn operation_context(operation: &str, plugin: &str) -> OperationContext {
    OperationContext::new("plugin-manager")
        .with_operation(operation)
        .with_plugin(plugin)
}

fn operation_span(operation: &str, plugin: &str) -> tracing::Span {
    operation_context(operation, plugin).span()
}

fn guard(plugin: &str, violation: GuardViolation) -> PluginError {
    PluginError::LifecycleGuard {
        plugin: plugin.to_owned(),
        violation,
    }
}

impl PluginManager {
    /// A manager with everything derived from `config`.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        PluginManagerBuilder::new(config).build()
    }

    /// Start building a manager.
    #[must_use]
    pub fn builder(config: ManagerConfig) -> PluginManagerBuilder {
        PluginManagerBuilder::new(config)
    }

    /// Settings the manager was built from.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The security service.
    #[must_use]
    pub fn security(&self) -> &Arc<SecurityService> {
        &self.security
    }

    /// The capability manager.
    #[must_use]
    pub fn capabilities(&self) -> &Arc<CapabilityManager> {
        &self.capabilities
    }

    /// The lifecycle bus.
    #[must_use]
    pub fn events(&self) -> &LifecycleBus {
        &self.events
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> LifecycleReceiver {
        self.events.subscribe()
    }

    /// Whether a persistence write or read has failed since startup.
    #[must_use]
    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Startup and shutdown
    // -----------------------------------------------------------------------

    /// Restore persisted registrations, load plugins from the configured
    /// directories, and re-activate the plugins that were enabled when
    /// state was last saved.
    ///
    /// # Errors
    ///
    /// Individual plugin failures are reported in the summary, not as
    /// errors. Persistence failures degrade to memory.
    pub async fn init(&self) -> PluginResult<LoadSummary> {
        self.init_inner()
            .instrument(operation_span("init", "*"))
            .await
    }

    async fn init_inner(&self) -> PluginResult<LoadSummary> {
        let mut persisted = match self.persistence.load().await {
            Ok(regs) => regs,
            Err(e) => {
                self.degrade(&e);
                Vec::new()
            },
        };
        let mut reactivate = Vec::new();
        for reg in &mut persisted {
            if reg.status == PluginStatus::Enabled {
                reactivate.push(reg.manifest.clone());
                reg.status = PluginStatus::Disabled;
            }
        }
        let restored = persisted.len();
        self.registry.write().await.restore(persisted);

        let mut summary = self.load_from_directories().await?;
        summary.restored = restored;

        let order = install_order(&reactivate).unwrap_or_else(|_| {
            let mut names: Vec<String> = reactivate.iter().map(|m| m.name.clone()).collect();
            names.sort();
            names
        });
        for name in order {
            let status = self.registry.read().await.get(&name).map(|r| r.status);
            if status != Some(PluginStatus::Disabled) {
                continue;
            }
            match self.enable_plugin(&name).await {
                Ok(()) => summary.enabled.push(name),
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Failed to re-activate plugin");
                    summary.failed.push((name, e.to_string()));
                },
            }
        }
        info!(
            restored = summary.restored,
            registered = summary.registered.len(),
            enabled = summary.enabled.len(),
            failed = summary.failed.len(),
            "Plugin manager initialised"
        );
        Ok(summary)
    }

    /// Deactivate every enabled plugin, dependents first. Statuses are left
    /// as they are so the next [`init`](Self::init) re-activates them.
    pub async fn shutdown(&self) {
        let enabled: Vec<PluginManifest> = {
            let registry = self.registry.read().await;
            registry
                .query(&PluginQuery::all().with_status(PluginStatus::Enabled))
                .into_iter()
                .map(|reg| reg.manifest.clone())
                .collect()
        };
        let mut order = install_order(&enabled)
            .unwrap_or_else(|_| enabled.iter().map(|m| m.name.clone()).collect());
        order.reverse();
        for name in &order {
            self.deactivate(name).await;
        }
        info!(count = order.len(), "Plugin manager shut down");
    }

    /// Discover manifests in the loader's directories and register them in
    /// dependency order, instantiating their units. With `auto_enable` set,
    /// newly installed plugins are enabled as well.
    ///
    /// # Errors
    ///
    /// Individual plugin failures are reported in the summary, not as
    /// errors.
    pub async fn load_from_directories(&self) -> PluginResult<LoadSummary> {
        let discovered = PluginLoader::sort_for_install(self.loader.discover());
        let mut summary = LoadSummary::default();
        let mut installed = Vec::new();

        for plugin in discovered {
            let name = plugin.manifest.name.clone();
            let result = self
                .register_inner(plugin.manifest, None, Some(&plugin.directory))
                .instrument(operation_span("register", &name))
                .await;
            match result {
                Ok(outcome) => {
                    if outcome == RegisterOutcome::Installed {
                        installed.push(name.clone());
                    }
                    summary.registered.push(name);
                },
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Failed to register discovered plugin");
                    summary.failed.push((name, e.to_string()));
                },
            }
        }

        if self.config.auto_enable {
            for name in installed {
                match self.enable_plugin(&name).await {
                    Ok(()) => summary.enabled.push(name),
                    Err(e) => {
                        warn!(plugin = %name, error = %e, "Failed to auto-enable plugin");
                        summary.failed.push((name, e.to_string()));
                    },
                }
            }
        }
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a manifest. A native or WASM `[entry]` is instantiated
    /// through the loader with paths relative to the working directory.
    ///
    /// Registering the same name and version again is a no-op; a
    /// different version is an [`update`](Self::update_plugin).
    ///
    /// # Errors
    ///
    /// Returns the first failing registration check. If the plugin was
    /// registered but its unit could not be created, it is left in `error`.
    pub async fn register_plugin(&self, manifest: PluginManifest) -> PluginResult<RegisterOutcome> {
        let span = operation_span("register", &manifest.name);
        self.register_inner(manifest, None, None).instrument(span).await
    }

    /// Register a manifest together with its already-built unit.
    ///
    /// # Errors
    ///
    /// Same as [`register_plugin`](Self::register_plugin).
    pub async fn register_plugin_with_unit(
        &self,
        manifest: PluginManifest,
        unit: Box<dyn PluginUnit>,
    ) -> PluginResult<RegisterOutcome> {
        let span = operation_span("register", &manifest.name);
        self.register_inner(manifest, Some(unit), None)
            .instrument(span)
            .await
    }

    async fn register_inner(
        &self,
        manifest: PluginManifest,
        unit: Option<Box<dyn PluginUnit>>,
        dir: Option<&Path>,
    ) -> PluginResult<RegisterOutcome> {
        let name = manifest.name.clone();
        let current = self
            .registry
            .read()
            .await
            .get(&name)
            .map(|r| r.version().to_owned());
        if current.is_some_and(|v| v != manifest.version) {
            let ctx = operation_context("update", &name);
            let previous_version = self
                .update_inner(&ctx, manifest, unit, dir)
                .instrument(ctx.span())
                .await?;
            return Ok(RegisterOutcome::Updated { previous_version });
        }

        let outcome = self.registry.write().await.register(manifest.clone());
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_recoverable_local() {
                    self.events.publish(LifecycleEvent::error(&name, e.to_string()));
                }
                return Err(e);
            },
        };
        if outcome == RegisterOutcome::Installed {
            self.persist(&name).await;
            self.events
                .publish(LifecycleEvent::installed(&name, &manifest.version));
        }

        if !self.has_unit(&name) {
            let unit = match unit {
                Some(unit) => Some(unit),
                None => match self.instantiate(&manifest, dir) {
                    Ok(unit) => unit,
                    Err(e) => return Err(self.fail(&name, e).await),
                },
            };
            if let Some(unit) = unit {
                self.store_unit(&name, unit);
            }
        } else if unit.is_some() {
            debug!(plugin = %name, "Unit already attached, ignoring the new one");
        }
        Ok(outcome)
    }

    /// Activate a plugin: scan its source, run its activation hook inside
    /// the sandbox, and register its capability handlers. Enabling an
    /// enabled plugin is a no-op; enabling from `error` is allowed.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown name
    /// - [`PluginError::LifecycleGuard`] if the status does not allow it or
    ///   a required dependency is not enabled (state unchanged)
    /// - any scan, activation or sandbox error (plugin moved to `error`)
    pub async fn enable_plugin(&self, name: &str) -> PluginResult<()> {
        self.enable_inner(name)
            .instrument(operation_span("enable", name))
            .await
    }

    async fn enable_inner(&self, name: &str) -> PluginResult<()> {
        let (manifest, config) = {
            let registry = self.registry.read().await;
            let reg = registry
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
            if reg.status == PluginStatus::Enabled {
                debug!(plugin = %name, "Already enabled");
                return Ok(());
            }
            if !reg.status.can_enable() {
                return Err(guard(
                    name,
                    GuardViolation::InvalidTransition {
                        from: reg.status,
                        action: "enable",
                    },
                ));
            }
            let missing = registry.check_enabled_dependencies(name)?;
            if !missing.is_empty() {
                return Err(guard(name, GuardViolation::MissingDependencies(missing)));
            }
            (reg.manifest.clone(), reg.config.clone())
        };

        let count = match self.activate(&manifest, config).await {
            Ok(count) => count,
            Err(e) => return Err(self.fail(name, e).await),
        };
        {
            let mut registry = self.registry.write().await;
            registry.set_status(name, PluginStatus::Enabled)?;
            registry.mark_activated(name)?;
        }
        self.persist(name).await;
        self.events.publish(LifecycleEvent::enabled(name));
        info!(plugin = %name, capabilities = count, "Plugin enabled");
        Ok(())
    }

    /// Deactivate a plugin. Disabling a disabled plugin is a no-op.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown name
    /// - [`PluginError::LifecycleGuard`] if enabled plugins still require
    ///   it, or its status does not allow it (state unchanged)
    pub async fn disable_plugin(&self, name: &str) -> PluginResult<()> {
        self.disable_inner(name)
            .instrument(operation_span("disable", name))
            .await
    }

    async fn disable_inner(&self, name: &str) -> PluginResult<()> {
        {
            let registry = self.registry.read().await;
            let reg = registry
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
            if reg.status == PluginStatus::Disabled {
                debug!(plugin = %name, "Already disabled");
                return Ok(());
            }
            if !reg.status.can_disable() {
                return Err(guard(
                    name,
                    GuardViolation::InvalidTransition {
                        from: reg.status,
                        action: "disable",
                    },
                ));
            }
            let blocking = registry.find_enabled_dependents(name);
            if !blocking.is_empty() {
                return Err(guard(name, GuardViolation::BlockingDependents(blocking)));
            }
        }

        self.deactivate(name).await;
        self.registry
            .write()
            .await
            .set_status(name, PluginStatus::Disabled)?;
        self.persist(name).await;
        self.events.publish(LifecycleEvent::disabled(name));
        info!(plugin = %name, "Plugin disabled");
        Ok(())
    }

    /// Remove a plugin, disabling it first if needed.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown name
    /// - [`PluginError::LifecycleGuard`] if any registered plugin requires
    ///   it (state unchanged)
    pub async fn uninstall_plugin(&self, name: &str) -> PluginResult<()> {
        self.uninstall_inner(name)
            .instrument(operation_span("uninstall", name))
            .await
    }

    async fn uninstall_inner(&self, name: &str) -> PluginResult<()> {
        let status = {
            let registry = self.registry.read().await;
            let reg = registry
                .get(name)
                .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
            let dependents = registry.check_reverse_dependencies(name);
            if !dependents.is_empty() {
                return Err(guard(name, GuardViolation::RequiredBy(dependents)));
            }
            reg.status
        };

        if status == PluginStatus::Enabled {
            self.deactivate(name).await;
            self.events.publish(LifecycleEvent::disabled(name));
        }
        self.registry.write().await.remove(name)?;
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.capabilities.unregister_plugin(name);
        self.security.destroy_sandbox(name);
        if let Err(e) = self.persistence.delete(name).await {
            self.degrade(&e);
        }
        self.events.publish(LifecycleEvent::uninstalled(name));
        info!(plugin = %name, "Plugin uninstalled");
        Ok(())
    }

    /// Replace a plugin's manifest with a strictly newer version, keeping
    /// its unit. An enabled plugin is deactivated and re-activated within
    /// the same call. Returns the replaced version.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] for an unknown name
    /// - [`PluginError::VersionNotGreater`] unless the version increases
    ///   (state unchanged)
    /// - any registration check error (plugin moved to `error`)
    /// - any re-activation error (plugin moved to `error` on the new
    ///   version)
    pub async fn update_plugin(&self, manifest: PluginManifest) -> PluginResult<String> {
        let ctx = operation_context("update", &manifest.name);
        self.update_inner(&ctx, manifest, None, None)
            .instrument(ctx.span())
            .await
    }

    /// Like [`update_plugin`](Self::update_plugin), replacing the unit.
    ///
    /// # Errors
    ///
    /// Same as [`update_plugin`](Self::update_plugin).
    pub async fn update_plugin_with_unit(
        &self,
        manifest: PluginManifest,
        unit: Box<dyn PluginUnit>,
    ) -> PluginResult<String> {
        let ctx = operation_context("update", &manifest.name);
        self.update_inner(&ctx, manifest, Some(unit), None)
            .instrument(ctx.span())
            .await
    }

    /// The internal deactivate and re-enable run as children of `ctx`.
    async fn update_inner(
        &self,
        ctx: &OperationContext,
        manifest: PluginManifest,
        unit: Option<Box<dyn PluginUnit>>,
        dir: Option<&Path>,
    ) -> PluginResult<String> {
        let name = manifest.name.clone();
        let (previous_status, previous_error, checked) = {
            let registry = self.registry.read().await;
            let reg = registry
                .get(&name)
                .ok_or_else(|| PluginError::NotFound(name.clone()))?;
            if reg.status == PluginStatus::Updating {
                return Err(guard(
                    &name,
                    GuardViolation::InvalidTransition {
                        from: reg.status,
                        action: "update",
                    },
                ));
            }
            (
                reg.status,
                reg.last_error.clone(),
                registry.check_update(&manifest),
            )
        };
        if let Err(e) = checked {
            return Err(self.fail(&name, e).await);
        }

        self.registry
            .write()
            .await
            .set_status(&name, PluginStatus::Updating)?;
        if previous_status == PluginStatus::Enabled {
            self.deactivate(&name)
                .instrument(ctx.child("disable").span())
                .await;
        }

        let to_version = manifest.version.clone();
        let replaced = self.registry.write().await.update(manifest.clone());
        let from_version = match replaced {
            Ok(version) => version,
            Err(e) => return Err(self.fail(&name, e).await),
        };

        let had_unit = self.has_unit(&name);
        let unit = match unit {
            Some(unit) => Some(unit),
            None if dir.is_some() || !had_unit => match self.instantiate(&manifest, dir) {
                Ok(unit) => unit,
                Err(e) => return Err(self.fail(&name, e).await),
            },
            None => None,
        };
        if let Some(unit) = unit {
            self.store_unit(&name, unit);
        }

        self.events
            .publish(LifecycleEvent::updated(&name, &from_version, &to_version));
        info!(plugin = %name, from = %from_version, to = %to_version, "Plugin updated");

        if previous_status == PluginStatus::Enabled {
            self.registry
                .write()
                .await
                .set_status(&name, PluginStatus::Disabled)?;
            self.enable_inner(&name)
                .instrument(ctx.child("enable").span())
                .await?;
        } else {
            self.registry
                .write()
                .await
                .restore_status(&name, previous_status, previous_error)?;
            self.persist(&name).await;
        }
        debug!(plugin = %name, elapsed_ms = ctx.elapsed_ms(), "Update finished");
        Ok(from_version)
    }

    /// Replace a plugin's configuration object. An enabled plugin sees the
    /// new configuration on its next activation.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for an unknown name.
    pub async fn set_plugin_config(&self, name: &str, config: Map<String, Value>) -> PluginResult<()> {
        self.registry.write().await.set_config(name, config)?;
        self.persist(name).await;
        debug!(plugin = %name, "Plugin configuration replaced");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// A registration by name.
    pub async fn get(&self, name: &str) -> Option<PluginRegistration> {
        self.registry.read().await.get(name).cloned()
    }

    /// Registrations matching `query`, ordered by name.
    pub async fn query(&self, query: &PluginQuery) -> Vec<PluginRegistration> {
        self.registry
            .read()
            .await
            .query(query)
            .into_iter()
            .cloned()
            .collect()
    }

    /// The current dependency graph.
    pub async fn dependency_graph(&self) -> Arc<DependencyGraph> {
        self.registry.read().await.dependency_graph()
    }

    /// Registry statistics.
    pub async fn stats(&self) -> RegistryStats {
        self.registry.read().await.stats()
    }

    // -----------------------------------------------------------------------
    // Capabilities
    // -----------------------------------------------------------------------

    /// Invoke the winning implementation of `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if nothing implements it, or the
    /// handler's error (including a sandbox timeout).
    pub async fn invoke(
        &self,
        capability: Capability,
        request: CapabilityRequest,
    ) -> PluginResult<Value> {
        self.capabilities.invoke_primary(capability, request).await
    }

    /// Invoke every implementation of `capability`.
    pub async fn broadcast(
        &self,
        capability: Capability,
        request: CapabilityRequest,
    ) -> Vec<BroadcastOutcome> {
        self.capabilities.broadcast(capability, request).await
    }

    /// The winning implementation of `capability`.
    #[must_use]
    pub fn primary_implementation(&self, capability: Capability) -> Option<CapabilityRegistration> {
        self.capabilities.primary(capability)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Create the sandbox, run the unit's activation hook and register the
    /// resulting handlers. Returns the number of registered capabilities.
    async fn activate(&self, manifest: &PluginManifest, config: Map<String, Value>) -> PluginResult<usize> {
        let name = manifest.name.as_str();
        let sandbox = self
            .security
            .create_sandbox(name, manifest.permission_set(), None);

        let mut implementations = Vec::new();
        if let Some(unit) = self.unit(name) {
            let mut unit = unit.lock().await;
            if let Some(source) = unit.source() {
                self.security.ensure_safe(name, source)?;
            }
            let ctx = PluginContext::new(name, config, Arc::clone(&sandbox), self.services.clone());
            implementations = sandbox.execute("activate", unit.activate(&ctx)).await??;
        }

        let claimed = extract_capabilities(manifest);
        if let Some(stray) = implementations
            .iter()
            .find(|imp| !claimed.contains(&imp.capability))
        {
            return Err(PluginError::Activation {
                plugin: name.to_owned(),
                message: format!(
                    "unit implements {} which the manifest does not contribute",
                    stray.capability
                ),
            });
        }
        for &cap in &claimed {
            if !implementations.iter().any(|imp| imp.capability == cap) {
                implementations.push(CapabilityImplementation::new(
                    cap,
                    ManifestHandler::new(manifest, cap),
                ));
            }
        }

        let count = implementations.len();
        for imp in implementations {
            let priority = manifest
                .priority
                .unwrap_or_else(|| imp.capability.priority());
            let sandboxed = CapabilityImplementation::new(
                imp.capability,
                SandboxedHandler::new(imp.handler, Arc::clone(&sandbox)),
            );
            self.capabilities.register(name, sandboxed, priority);
        }
        Ok(count)
    }

    /// Unregister capabilities, stop the unit and drop the sandbox. Unit
    /// failures are logged; teardown always completes.
    async fn deactivate(&self, name: &str) {
        self.capabilities.unregister_plugin(name);
        if let Some(unit) = self.unit(name) {
            let mut unit = unit.lock().await;
            let result = match self.security.sandbox(name) {
                Some(sandbox) => match sandbox.execute("deactivate", unit.deactivate()).await {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                },
                None => unit.deactivate().await,
            };
            if let Err(e) = result {
                warn!(plugin = %name, error = %e, "Unit deactivation failed");
            }
        }
        self.remove_routes(name).await;
        self.security.destroy_sandbox(name);
    }

    async fn remove_routes(&self, name: &str) {
        if let Some(routes) = &self.services.routes
            && let Err(e) = routes.remove_routes(name).await
        {
            warn!(plugin = %name, error = %e, "Route removal failed");
        }
    }

    /// Tear down after a plugin-local failure and move the plugin to
    /// `error`. Other errors pass through untouched.
    async fn fail(&self, name: &str, err: PluginError) -> PluginError {
        if !err.is_recoverable_local() {
            return err;
        }
        self.capabilities.unregister_plugin(name);
        self.remove_routes(name).await;
        self.security.destroy_sandbox(name);
        let message = err.to_string();
        let marked = self.registry.write().await.mark_error(name, message.clone());
        if marked.is_ok() {
            self.persist(name).await;
        }
        self.events.publish(LifecycleEvent::error(name, message));
        err
    }

    async fn persist(&self, name: &str) {
        let Some(reg) = self.registry.read().await.get(name).cloned() else {
            return;
        };
        if let Err(e) = self.persistence.save(&reg).await {
            self.degrade(&e);
        }
    }

    fn degrade(&self, e: &PluginError) {
        if self.persistence_degraded.swap(true, Ordering::Relaxed) {
            debug!(error = %e, "Plugin persistence still failing");
        } else {
            warn!(error = %e, "Plugin persistence failed, continuing in memory");
        }
    }

    fn instantiate(
        &self,
        manifest: &PluginManifest,
        dir: Option<&Path>,
    ) -> PluginResult<Option<Box<dyn PluginUnit>>> {
        self.loader
            .instantiate(manifest, dir.unwrap_or(Path::new(".")))
    }

    fn unit(&self, name: &str) -> Option<SharedUnit> {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn has_unit(&self, name: &str) -> bool {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn store_unit(&self, name: &str, unit: Box<dyn PluginUnit>) {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::new(AsyncMutex::new(unit)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::handler::FnHandler;
    use crate::unit::HandlerUnit;

    fn manager() -> PluginManager {
        PluginManager::new(ManagerConfig::default())
    }

    fn view(name: &str) -> PluginManifest {
        PluginManifest::new(name, "1.0.0").contribute(Capability::ViewProvider, format!("{name}-view"))
    }

    #[tokio::test]
    async fn test_register_enable_disable() {
        let mgr = manager();
        let mut rx = mgr.subscribe();
        assert_eq!(mgr.register_plugin(view("geo")).await.unwrap(), RegisterOutcome::Installed);
        mgr.enable_plugin("geo").await.unwrap();

        let reg = mgr.get("geo").await.unwrap();
        assert_eq!(reg.status, PluginStatus::Enabled);
        assert!(reg.last_activated_at.is_some());
        assert_eq!(mgr.capabilities().providers(Capability::ViewProvider), vec!["geo"]);
        assert!(mgr.security().sandbox("geo").is_some());

        mgr.disable_plugin("geo").await.unwrap();
        assert_eq!(mgr.get("geo").await.unwrap().status, PluginStatus::Disabled);
        assert!(mgr.capabilities().counts().is_empty());
        assert!(mgr.security().sandbox("geo").is_none());

        let types: Vec<&str> = std::iter::from_fn(|| rx.try_recv())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(types, vec!["installed", "enabled", "disabled"]);
    }

    #[tokio::test]
    async fn test_enable_and_disable_are_idempotent() {
        let mgr = manager();
        mgr.register_plugin(view("geo")).await.unwrap();
        mgr.enable_plugin("geo").await.unwrap();
        mgr.enable_plugin("geo").await.unwrap();
        assert_eq!(mgr.capabilities().counts().get(&Capability::ViewProvider), Some(&1));
        mgr.disable_plugin("geo").await.unwrap();
        mgr.disable_plugin("geo").await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_installed_is_refused() {
        let mgr = manager();
        mgr.register_plugin(view("geo")).await.unwrap();
        let err = mgr.disable_plugin("geo").await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::LifecycleGuard {
                violation: GuardViolation::InvalidTransition { .. },
                ..
            }
        ));
        assert_eq!(mgr.get("geo").await.unwrap().status, PluginStatus::Installed);
    }

    #[tokio::test]
    async fn test_unit_handlers_replace_manifest_handlers() {
        let mgr = manager();
        let unit = HandlerUnit::new().with_handler(
            Capability::Formula,
            FnHandler::new("sum", |req| Ok(json!({ "op": req.operation, "result": 3 }))),
        );
        let manifest = PluginManifest::new("calc", "1.0.0")
            .contribute(Capability::Formula, "SUM")
            .contribute(Capability::Command, "recalc");
        mgr.register_plugin_with_unit(manifest, Box::new(unit))
            .await
            .unwrap();
        mgr.enable_plugin("calc").await.unwrap();

        let out = mgr
            .invoke(Capability::Formula, CapabilityRequest::new("evaluate"))
            .await
            .unwrap();
        assert_eq!(out["result"], 3);

        let out = mgr
            .invoke(Capability::Command, CapabilityRequest::new("run"))
            .await
            .unwrap();
        assert_eq!(out["contributions"][0], "recalc");
    }

    #[tokio::test]
    async fn test_stray_capability_moves_to_error() {
        let mgr = manager();
        let unit = HandlerUnit::new()
            .with_handler(Capability::Command, FnHandler::new("cmd", |_| Ok(Value::Null)));
        mgr.register_plugin_with_unit(view("geo"), Box::new(unit))
            .await
            .unwrap();

        let err = mgr.enable_plugin("geo").await.unwrap_err();
        assert!(matches!(err, PluginError::Activation { .. }));
        let reg = mgr.get("geo").await.unwrap();
        assert_eq!(reg.status, PluginStatus::Error);
        assert!(reg.last_error.unwrap().contains("does not contribute"));
        assert!(mgr.capabilities().counts().is_empty());
        assert!(mgr.security().sandbox("geo").is_none());
    }

    #[tokio::test]
    async fn test_manifest_priority_overrides_default() {
        let mgr = manager();
        mgr.register_plugin(view("plain")).await.unwrap();
        mgr.register_plugin(view("boosted").with_priority(90)).await.unwrap();
        mgr.enable_plugin("plain").await.unwrap();
        mgr.enable_plugin("boosted").await.unwrap();

        let primary = mgr.primary_implementation(Capability::ViewProvider).unwrap();
        assert_eq!(primary.plugin, "boosted");
        assert_eq!(primary.priority, 90);
    }

    #[tokio::test]
    async fn test_set_plugin_config_reaches_unit() {
        #[derive(Debug)]
        struct ConfigProbe;

        #[async_trait::async_trait]
        impl PluginUnit for ConfigProbe {
            async fn activate(
                &mut self,
                ctx: &PluginContext,
            ) -> PluginResult<Vec<CapabilityImplementation>> {
                let zoom = ctx.config_value("zoom").cloned().unwrap_or(Value::Null);
                Ok(vec![CapabilityImplementation::new(
                    Capability::ViewProvider,
                    FnHandler::new("zoom", move |_| Ok(zoom.clone())),
                )])
            }
        }

        let mgr = manager();
        mgr.register_plugin_with_unit(view("geo"), Box::new(ConfigProbe))
            .await
            .unwrap();
        let mut config = Map::new();
        config.insert("zoom".into(), json!(7));
        mgr.set_plugin_config("geo", config).await.unwrap();
        mgr.enable_plugin("geo").await.unwrap();

        let out = mgr
            .invoke(Capability::ViewProvider, CapabilityRequest::new("render"))
            .await
            .unwrap();
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let mgr = manager();
        assert!(matches!(
            mgr.enable_plugin("ghost").await.unwrap_err(),
            PluginError::NotFound(_)
        ));
        assert!(matches!(
            mgr.uninstall_plugin("ghost").await.unwrap_err(),
            PluginError::NotFound(_)
        ));
        assert!(mgr.set_plugin_config("ghost", Map::new()).await.is_err());
    }

    #[test]
    fn test_manager_config_from_config() {
        let mut config = Config::default();
        config.host.version = "2.3.0".into();
        config.sandbox.cpu_seconds = 5;
        config.plugins.auto_enable = true;

        let settings = ManagerConfig::from_config(&config).unwrap();
        assert_eq!(settings.host_version, Version::new(2, 3, 0));
        assert_eq!(settings.limits.cpu_seconds, 5);
        assert!(settings.auto_enable);

        config.host.version = "two".into();
        assert!(matches!(
            ManagerConfig::from_config(&config).unwrap_err(),
            PluginError::Config(_)
        ));
    }
}
