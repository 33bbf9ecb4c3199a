//! Prelude module - commonly used types for convenient import.
//!
//! Use `use tabula_plugins::prelude::*;` to import all essential types.

// Errors
pub use crate::{GuardViolation, PluginError, PluginResult};

// Manifests and capabilities
pub use crate::{Capability, ContributionDef, EntryKind, EntryPoint, PluginManifest};

// Registry
pub use crate::{PluginQuery, PluginRegistration, PluginStatus, RegisterOutcome};

// Units and handlers
pub use crate::{
    CapabilityHandler, CapabilityImplementation, CapabilityRequest, HandlerUnit, PluginContext,
    PluginUnit,
};

// Manager
pub use crate::{LifecycleEvent, ManagerConfig, PluginManager, PluginManagerBuilder};
