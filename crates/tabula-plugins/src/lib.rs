//! Tabula Plugins - registry, capability resolution and lifecycle management.
//!
//! This crate hosts third-party extensions of the Tabula engine:
//! - [`manifest`] and [`validate`]: what a plugin declares, and whether it is
//!   acceptable for this host
//! - [`capability`] and [`resolver`]: the capability model and dependency
//!   resolution (cycles, version conflicts, install order)
//! - [`registry`] and [`graph`]: the canonical set of registrations and the
//!   derived dependency graph
//! - [`loader`] and [`unit`]: manifest discovery on disk and instantiation
//!   of executable units (native, or WASM behind the `wasm` feature)
//! - [`capability_manager`] and [`handler`]: who implements each capability,
//!   in priority order, and how to invoke it
//! - [`manager`]: the façade that drives install, enable, disable, update
//!   and uninstall, with [`events`] and [`persistence`] on the side
//!
//! Plugin code always runs inside a [`tabula_sandbox::PluginSandbox`].
//!
//! # Example
//!
//! ```no_run
//! use tabula_plugins::prelude::*;
//!
//! # async fn run() -> PluginResult<()> {
//! let manager = PluginManager::new(ManagerConfig::default());
//! let geo = PluginManifest::new("geo", "1.0.0")
//!     .with_permission("network")
//!     .contribute(Capability::FieldType, "latlng")
//!     .contribute(Capability::ViewProvider, "map");
//!
//! manager.register_plugin(geo).await?;
//! manager.enable_plugin("geo").await?;
//! let out = manager
//!     .invoke(Capability::ViewProvider, CapabilityRequest::new("render"))
//!     .await?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod capability;
pub mod capability_manager;
pub mod context;
pub mod error;
pub mod events;
pub mod graph;
pub mod handler;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod persistence;
pub mod registration;
pub mod registry;
pub mod resolver;
pub mod services;
pub mod unit;
pub mod validate;

pub use capability::{Capability, UnknownCapability};
pub use capability_manager::{BroadcastOutcome, CapabilityManager, CapabilityRegistration};
pub use context::{PluginContext, ScopedStorage};
pub use error::{GuardViolation, PluginError, PluginResult};
pub use events::{EventMetadata, LifecycleBus, LifecycleEvent, LifecycleReceiver};
pub use graph::{DependencyGraph, EdgeKind, GraphEdge, GraphNode};
pub use handler::{
    CapabilityHandler, CapabilityImplementation, CapabilityRequest, FnHandler, ManifestHandler,
    SandboxedHandler,
};
pub use loader::{DiscoveredPlugin, MANIFEST_FILE_NAME, PluginLoader, load_manifests_from_dir};
pub use manager::{LoadSummary, ManagerConfig, PluginManager, PluginManagerBuilder};
pub use manifest::{ContributionDef, Contributions, EntryKind, EntryPoint, PluginManifest};
pub use persistence::{FilePersistence, MemoryPersistence, PersistenceProvider};
pub use registration::{DependencySpec, PluginRegistration, PluginStatus};
pub use registry::{PluginQuery, PluginRegistry, RegisterOutcome, RegistryStats};
pub use resolver::{DependencyReport, MissingDependency, VersionConflict};
pub use services::{
    CacheService, HostServices, MemoryStore, NotificationService, QueueService, RouteRegistrar,
    StorageService,
};
#[cfg(feature = "wasm")]
pub use unit::{WasmUnit, WasmUnitFactory};
pub use unit::{HandlerUnit, NativeUnitFactory, PluginUnit, UnitFactory, verify_hash};
pub use validate::{IssueSeverity, ValidationIssue, ValidationReport};
