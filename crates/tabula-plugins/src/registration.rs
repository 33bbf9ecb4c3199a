//! Registry entries and lifecycle status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::manifest::PluginManifest;
use crate::validate::extract_capabilities;

/// Lifecycle status of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Manifest read, not yet registered.
    Discovered,
    /// Registered but never enabled.
    Installed,
    /// Active: capabilities registered, unit running.
    Enabled,
    /// Registered but inactive.
    Disabled,
    /// An update is in progress.
    Updating,
    /// A lifecycle operation failed; see `last_error`.
    Error,
}

impl PluginStatus {
    /// Whether `enable` may start from this status.
    #[must_use]
    pub fn can_enable(self) -> bool {
        matches!(self, Self::Installed | Self::Disabled | Self::Error)
    }

    /// Whether `disable` may start from this status.
    #[must_use]
    pub fn can_disable(self) -> bool {
        self == Self::Enabled
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovered => "discovered",
            Self::Installed => "installed",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Updating => "updating",
            Self::Error => "error",
        })
    }
}

/// A dependency declared by a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Dependency name.
    pub name: String,
    /// Accepted semver range.
    pub version_range: String,
    /// Peer dependencies are optional.
    pub optional: bool,
}

impl DependencySpec {
    /// Required and peer dependencies of `manifest`, required first.
    #[must_use]
    pub fn from_manifest(manifest: &PluginManifest) -> Vec<Self> {
        let required = manifest.dependencies.iter().map(|(name, range)| Self {
            name: name.clone(),
            version_range: range.clone(),
            optional: false,
        });
        let peers = manifest.peer_dependencies.iter().map(|(name, range)| Self {
            name: name.clone(),
            version_range: range.clone(),
            optional: true,
        });
        required.chain(peers).collect()
    }
}

/// A plugin known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRegistration {
    /// The manifest, replaced wholesale on update.
    pub manifest: PluginManifest,
    /// Capabilities derived from the manifest.
    pub capabilities: Vec<Capability>,
    /// Declared dependencies.
    pub dependencies: Vec<DependencySpec>,
    /// Lifecycle status.
    pub status: PluginStatus,
    /// First registration time.
    pub installed_at: DateTime<Utc>,
    /// Last manifest change.
    pub updated_at: DateTime<Utc>,
    /// Last successful enable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated_at: Option<DateTime<Utc>>,
    /// Message of the last failure while in `error` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The plugin's configuration object.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl PluginRegistration {
    /// A fresh `discovered` entry for `manifest`.
    #[must_use]
    pub fn new(manifest: PluginManifest) -> Self {
        let now = Utc::now();
        Self {
            capabilities: extract_capabilities(&manifest),
            dependencies: DependencySpec::from_manifest(&manifest),
            manifest,
            status: PluginStatus::Discovered,
            installed_at: now,
            updated_at: now,
            last_activated_at: None,
            last_error: None,
            config: serde_json::Map::new(),
        }
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Installed version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Names of required (non-optional) dependencies.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(|d| !d.optional)
            .map(|d| d.name.as_str())
    }

    /// Whether `name` is a required dependency.
    #[must_use]
    pub fn requires(&self, name: &str) -> bool {
        self.required_dependencies().any(|d| d == name)
    }

    /// Whether the plugin claims `capability`.
    #[must_use]
    pub fn provides(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registration_derives_fields() {
        let manifest = PluginManifest::new("geo", "1.0.0")
            .with_dependency("tiles", "^2")
            .with_peer_dependency("charts", "^1")
            .contribute(Capability::FieldType, "latlng");
        let reg = PluginRegistration::new(manifest);
        assert_eq!(reg.status, PluginStatus::Discovered);
        assert_eq!(reg.capabilities, vec![Capability::FieldType]);
        assert_eq!(reg.dependencies.len(), 2);
        assert!(reg.requires("tiles"));
        assert!(!reg.requires("charts"));
        assert!(reg.provides(Capability::FieldType));
        assert_eq!(reg.installed_at, reg.updated_at);
    }

    #[test]
    fn test_status_transitions() {
        assert!(PluginStatus::Installed.can_enable());
        assert!(PluginStatus::Disabled.can_enable());
        assert!(PluginStatus::Error.can_enable());
        assert!(!PluginStatus::Enabled.can_enable());
        assert!(!PluginStatus::Updating.can_enable());
        assert!(PluginStatus::Enabled.can_disable());
        assert!(!PluginStatus::Installed.can_disable());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&PluginStatus::Updating).unwrap();
        assert_eq!(json, "\"updating\"");
    }
}
