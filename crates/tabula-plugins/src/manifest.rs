//! Plugin manifest types.
//!
//! A manifest (`plugin.toml`, or JSON) declares a plugin's identity, the
//! host versions it supports, what it contributes, which other plugins it
//! needs, and the permissions it asks for. Manifests are immutable: an
//! update replaces the whole manifest.
//!
//! ```toml
//! name = "geo"
//! version = "1.0.0"
//! host_version = ">=1.0.0"
//! permissions = ["network"]
//!
//! [contributes]
//! field_types = ["latlng"]
//! views = [{ id = "map", title = "Map" }]
//!
//! [dependencies]
//! tiles = "^2.1"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tabula_sandbox::PermissionSet;

use crate::capability::Capability;
use crate::error::{PluginError, PluginResult};

/// A plugin manifest.
///
/// Required fields default to empty strings when absent so that
/// validation can report every problem at once instead of failing on
/// the first missing key during parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name: lowercase alphanumerics and hyphens.
    #[serde(default)]
    pub name: String,
    /// Semantic version.
    #[serde(default)]
    pub version: String,
    /// Semver range of host versions this plugin supports.
    #[serde(default, alias = "required_host_version")]
    pub host_version: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Overrides the default priority of every capability this plugin
    /// contributes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Contributed features.
    #[serde(default)]
    pub contributes: Contributions,
    /// Required plugins: name → semver range.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Optional plugins, version-checked when present: name → semver range.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    /// Declared permissions. `*` and `prefix.*` wildcards are allowed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// How to instantiate the executable unit. Plugins without an entry
    /// are purely declarative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPoint>,
}

/// Features a plugin contributes, one list per capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contributions {
    /// Spreadsheet views.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub views: Vec<ContributionDef>,
    /// Cell field types.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_types: Vec<ContributionDef>,
    /// Formula functions.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub formulas: Vec<ContributionDef>,
    /// Event triggers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<ContributionDef>,
    /// Actions.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ContributionDef>,
    /// User commands.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<ContributionDef>,
    /// Data source connectors.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_sources: Vec<ContributionDef>,
    /// Authentication providers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auth_providers: Vec<ContributionDef>,
    /// Scheduled jobs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scheduled_jobs: Vec<ContributionDef>,
    /// Notification channels.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notification_channels: Vec<ContributionDef>,
    /// Settings pages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub settings_pages: Vec<ContributionDef>,
    /// JSON schema of the plugin's configuration object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
}

impl Contributions {
    /// The contribution list that backs `capability`.
    #[must_use]
    pub fn list(&self, capability: Capability) -> &[ContributionDef] {
        match capability {
            Capability::ViewProvider => &self.views,
            Capability::FieldType => &self.field_types,
            Capability::Formula => &self.formulas,
            Capability::Trigger => &self.triggers,
            Capability::Action => &self.actions,
            Capability::Command => &self.commands,
            Capability::DataSource => &self.data_sources,
            Capability::AuthProvider => &self.auth_providers,
            Capability::ScheduledJob => &self.scheduled_jobs,
            Capability::NotificationChannel => &self.notification_channels,
            Capability::SettingsPage => &self.settings_pages,
        }
    }

    fn list_mut(&mut self, capability: Capability) -> &mut Vec<ContributionDef> {
        match capability {
            Capability::ViewProvider => &mut self.views,
            Capability::FieldType => &mut self.field_types,
            Capability::Formula => &mut self.formulas,
            Capability::Trigger => &mut self.triggers,
            Capability::Action => &mut self.actions,
            Capability::Command => &mut self.commands,
            Capability::DataSource => &mut self.data_sources,
            Capability::AuthProvider => &mut self.auth_providers,
            Capability::ScheduledJob => &mut self.scheduled_jobs,
            Capability::NotificationChannel => &mut self.notification_channels,
            Capability::SettingsPage => &mut self.settings_pages,
        }
    }

    /// Whether nothing is contributed (the configuration schema aside).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Capability::ALL.iter().all(|&cap| self.list(cap).is_empty())
    }
}

/// One contributed feature: a bare id or a table with a title and config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContributionDef {
    /// `"latlng"`
    Id(String),
    /// `{ id = "map", title = "Map", config = { ... } }`
    Detailed {
        /// Contribution id.
        id: String,
        /// Display title.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Free-form settings passed to the implementation.
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        config: serde_json::Value,
    },
}

impl ContributionDef {
    /// Contribution id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Detailed { id, .. } => id,
        }
    }
}

impl From<&str> for ContributionDef {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

impl From<String> for ContributionDef {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

/// How the executable unit is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Compiled into the host and registered with a native factory.
    Native,
    /// A WASM module run through Extism.
    Wasm,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::Wasm => "wasm",
        })
    }
}

/// Manifest `[entry]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Unit kind.
    pub kind: EntryKind,
    /// Artifact path, relative to the plugin directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// blake3 hex digest of the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl PluginManifest {
    /// Start a manifest that accepts any host version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            host_version: "*".to_owned(),
            ..Self::default()
        }
    }

    /// Set the supported host range.
    #[must_use]
    pub fn with_host_version(mut self, range: impl Into<String>) -> Self {
        self.host_version = range.into();
        self
    }

    /// Set the author.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Override the capability priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a required dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>, range: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), range.into());
        self
    }

    /// Add a peer dependency.
    #[must_use]
    pub fn with_peer_dependency(
        mut self,
        name: impl Into<String>,
        range: impl Into<String>,
    ) -> Self {
        self.peer_dependencies.insert(name.into(), range.into());
        self
    }

    /// Declare a permission.
    #[must_use]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    /// Contribute `id` under `capability`.
    #[must_use]
    pub fn contribute(mut self, capability: Capability, id: impl Into<ContributionDef>) -> Self {
        self.contributes.list_mut(capability).push(id.into());
        self
    }

    /// Set the entry point.
    #[must_use]
    pub fn with_entry(mut self, entry: EntryPoint) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Declared permissions as a set, ignoring blank entries.
    #[must_use]
    pub fn permission_set(&self) -> PermissionSet {
        self.permissions
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Parse a TOML manifest.
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed input.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parse a JSON manifest.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed input.
    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Read a manifest from disk. Files ending in `.json` are parsed as
    /// JSON, everything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the file cannot be read and
    /// [`PluginError::ManifestParse`] if it does not parse.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            Self::from_json_str(&content).map_err(|e| e.to_string())
        } else {
            Self::from_toml_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| PluginError::ManifestParse {
            path: path.to_path_buf(),
            message,
        })
    }
}
