//! Plugin registry.
//!
//! The single source of truth for which plugins are known, their manifests
//! and lifecycle status. Secondary indexes (by capability, by author) and
//! the dependency graph are derived from the registrations and rebuilt in
//! full after every mutation, so they can never drift from the primary map.
//!
//! The registry performs no I/O and runs no plugin code. Lifecycle guards
//! that need the capability manager or sandbox live in
//! [`PluginManager`](crate::manager::PluginManager).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{Capability, find_conflicts, missing_permissions, resolve_dependencies};
use crate::error::{PluginError, PluginResult};
use crate::graph::DependencyGraph;
use crate::manifest::PluginManifest;
use crate::registration::{DependencySpec, PluginRegistration, PluginStatus};
use crate::resolver::{self, DependencyReport};
use crate::validate::{
    ValidationReport, extract_capabilities, validate_capability_implementation, validate_manifest,
};

/// What [`PluginRegistry::register`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new registration was created.
    Installed,
    /// An existing registration was replaced by a newer version.
    Updated {
        /// Version that was replaced.
        previous_version: String,
    },
    /// The same name and version was already registered.
    Unchanged,
}

/// Filter for [`PluginRegistry::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginQuery {
    /// Exact plugin name.
    pub name: Option<String>,
    /// Lifecycle status.
    pub status: Option<PluginStatus>,
    /// Claimed capability.
    pub capability: Option<Capability>,
    /// Manifest author.
    pub author: Option<String>,
    /// Semver range the installed version must satisfy.
    pub version_range: Option<String>,
}

impl PluginQuery {
    /// Match every plugin.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter by name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Filter by status.
    #[must_use]
    pub fn with_status(mut self, status: PluginStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Filter by author.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Filter by version range.
    #[must_use]
    pub fn with_version_range(mut self, range: impl Into<String>) -> Self {
        self.version_range = Some(range.into());
        self
    }

    fn matches(&self, reg: &PluginRegistration) -> bool {
        self.name.as_deref().is_none_or(|n| reg.name() == n)
            && self.status.is_none_or(|s| reg.status == s)
            && self.capability.is_none_or(|c| reg.provides(c))
            && self
                .author
                .as_deref()
                .is_none_or(|a| reg.manifest.author.as_deref() == Some(a))
            && self
                .version_range
                .as_deref()
                .is_none_or(|r| resolver::satisfies(r, reg.version()))
    }
}

/// Registration counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// All registrations.
    pub total: usize,
    /// In `installed`.
    pub installed: usize,
    /// In `enabled`.
    pub enabled: usize,
    /// In `disabled`.
    pub disabled: usize,
    /// In `updating`.
    pub updating: usize,
    /// In `error`.
    pub error: usize,
    /// Plugins claiming each capability.
    pub per_capability: BTreeMap<Capability, usize>,
}

/// Registered plugins with derived indexes and dependency graph.
#[derive(Debug)]
pub struct PluginRegistry {
    host_version: Version,
    registrations: HashMap<String, PluginRegistration>,
    by_capability: HashMap<Capability, BTreeSet<String>>,
    by_author: HashMap<String, BTreeSet<String>>,
    graph: Arc<DependencyGraph>,
}

impl PluginRegistry {
    /// Create an empty registry for the given host version.
    #[must_use]
    pub fn new(host_version: Version) -> Self {
        Self {
            host_version,
            registrations: HashMap::new(),
            by_capability: HashMap::new(),
            by_author: HashMap::new(),
            graph: Arc::new(DependencyGraph::default()),
        }
    }

    /// The host version manifests are checked against.
    #[must_use]
    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Run every registration check against `manifest` without mutating
    /// anything.
    ///
    /// Checks run in order: manifest validation, capability implementation,
    /// capability conflicts and missing permissions over the capability
    /// closure, then dependency resolution against the registered set (with
    /// `manifest` standing in for any registration of the same name).
    ///
    /// # Errors
    ///
    /// Returns the first failing check's error. A dependency report is
    /// fatal only for cycles and version conflicts; missing dependencies
    /// are returned in the `Ok` report.
    pub fn prepare(&self, manifest: &PluginManifest) -> PluginResult<DependencyReport> {
        let name = manifest.name.clone();

        let mut report = validate_manifest(manifest, &self.host_version);
        let capabilities = extract_capabilities(manifest);
        for &cap in &capabilities {
            report.merge(validate_capability_implementation(manifest, cap));
        }
        for warning in report.warnings() {
            debug!(plugin = %name, field = %warning.field, "{}", warning.message);
        }
        if !report.ok {
            return Err(validation_error(name, &report));
        }

        let closure = resolve_dependencies(&capabilities);
        let conflicts = find_conflicts(&closure);
        if !conflicts.is_empty() {
            return Err(PluginError::CapabilityConflict {
                plugin: name,
                conflicts,
            });
        }

        let missing = missing_permissions(&closure, &manifest.permission_set());
        if !missing.is_empty() {
            return Err(PluginError::Permission {
                plugin: name,
                missing,
            });
        }

        let mut manifests = self.manifest_index();
        manifests.insert(manifest.name.as_str(), manifest);
        let mut deps = resolver::check_dependencies(&manifest.name, &manifests);
        if self.registrations.contains_key(&manifest.name) {
            deps.version_conflicts.extend(resolver::dependents_rejecting(
                &manifest.name,
                &manifest.version,
                &manifests,
            ));
        }
        if deps.has_fatal() {
            return Err(PluginError::Dependency {
                plugin: name,
                report: deps,
            });
        }
        if !deps.missing_required.is_empty() {
            debug!(plugin = %name, missing = %deps.summary(), "Registered with unmet dependencies");
        }
        Ok(deps)
    }

    /// Register a manifest.
    ///
    /// Registering the same name and version again is a no-op. Registering
    /// an existing name with a different version is an [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing [`prepare`](Self::prepare)
    /// check, or the update error for an existing name.
    pub fn register(&mut self, manifest: PluginManifest) -> PluginResult<RegisterOutcome> {
        if let Some(existing) = self.registrations.get(&manifest.name) {
            if existing.version() == manifest.version {
                debug!(plugin = %manifest.name, version = %manifest.version, "Already registered");
                return Ok(RegisterOutcome::Unchanged);
            }
            let previous_version = self.update(manifest)?;
            return Ok(RegisterOutcome::Updated { previous_version });
        }

        self.prepare(&manifest)?;
        let mut registration = PluginRegistration::new(manifest);
        registration.status = PluginStatus::Installed;
        info!(
            plugin = %registration.name(),
            version = %registration.version(),
            capabilities = registration.capabilities.len(),
            "Plugin registered"
        );
        self.registrations
            .insert(registration.name().to_owned(), registration);
        self.rebuild();
        Ok(RegisterOutcome::Installed)
    }

    /// Replace a registration's manifest with a strictly newer version.
    ///
    /// Status, install time, last activation and configuration are kept.
    /// Returns the replaced version.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] if `manifest.name` is not registered
    /// - [`PluginError::VersionNotGreater`] unless the version increases
    /// - any [`prepare`](Self::prepare) error
    pub fn update(&mut self, manifest: PluginManifest) -> PluginResult<String> {
        let current_version = self.check_update(&manifest)?;
        let name = manifest.name.clone();
        if let Some(reg) = self.registrations.get_mut(&name) {
            reg.capabilities = extract_capabilities(&manifest);
            reg.dependencies = DependencySpec::from_manifest(&manifest);
            reg.manifest = manifest;
            reg.updated_at = Utc::now();
            info!(plugin = %name, from = %current_version, to = %reg.version(), "Plugin updated");
        }
        self.rebuild();
        Ok(current_version)
    }

    /// Run the [`update`](Self::update) checks without mutating anything.
    /// Returns the installed version.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update).
    pub fn check_update(&self, manifest: &PluginManifest) -> PluginResult<String> {
        let current = self
            .registrations
            .get(&manifest.name)
            .ok_or_else(|| PluginError::NotFound(manifest.name.clone()))?;
        let current_version = current.version().to_owned();
        if !is_newer(&manifest.version, &current_version) {
            return Err(PluginError::VersionNotGreater {
                plugin: manifest.name.clone(),
                current: current_version,
                proposed: manifest.version.clone(),
            });
        }
        self.prepare(manifest)?;
        Ok(current_version)
    }

    /// Remove a registration. Guards are the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn remove(&mut self, name: &str) -> PluginResult<PluginRegistration> {
        let removed = self
            .registrations
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
        self.rebuild();
        info!(plugin = %name, "Plugin removed from registry");
        Ok(removed)
    }

    /// Set the lifecycle status. Leaving `error` clears `last_error`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn set_status(&mut self, name: &str, status: PluginStatus) -> PluginResult<()> {
        let reg = self.get_mut(name)?;
        let previous = reg.status;
        reg.status = status;
        if status != PluginStatus::Error {
            reg.last_error = None;
        }
        debug!(plugin = %name, from = %previous, to = %status, "Status changed");
        self.rebuild();
        Ok(())
    }

    /// Put back a status captured before an internal transition. The saved
    /// message is kept only when the status is `error`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn restore_status(
        &mut self,
        name: &str,
        status: PluginStatus,
        last_error: Option<String>,
    ) -> PluginResult<()> {
        let reg = self.get_mut(name)?;
        let previous = reg.status;
        reg.status = status;
        reg.last_error = last_error.filter(|_| status == PluginStatus::Error);
        debug!(plugin = %name, from = %previous, to = %status, "Status restored");
        self.rebuild();
        Ok(())
    }

    /// Move a plugin to `error`, recording `message`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn mark_error(&mut self, name: &str, message: impl Into<String>) -> PluginResult<()> {
        let message = message.into();
        let reg = self.get_mut(name)?;
        reg.status = PluginStatus::Error;
        warn!(plugin = %name, error = %message, "Plugin moved to error state");
        reg.last_error = Some(message);
        self.rebuild();
        Ok(())
    }

    /// Record a successful activation.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn mark_activated(&mut self, name: &str) -> PluginResult<()> {
        self.get_mut(name)?.last_activated_at = Some(Utc::now());
        Ok(())
    }

    /// Replace a plugin's configuration object.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn set_config(
        &mut self,
        name: &str,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> PluginResult<()> {
        self.get_mut(name)?.config = config;
        Ok(())
    }

    /// Look up a registration.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PluginRegistration> {
        self.registrations.get(name)
    }

    fn get_mut(&mut self, name: &str) -> PluginResult<&mut PluginRegistration> {
        self.registrations
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))
    }

    /// Registrations matching `query`, ordered by name.
    #[must_use]
    pub fn query(&self, query: &PluginQuery) -> Vec<&PluginRegistration> {
        let candidates: Box<dyn Iterator<Item = &String>> =
            match (query.capability, query.author.as_deref()) {
                (Some(cap), _) => Box::new(self.by_capability.get(&cap).into_iter().flatten()),
                (None, Some(author)) => Box::new(self.by_author.get(author).into_iter().flatten()),
                (None, None) => Box::new(self.registrations.keys()),
            };
        let mut matched: Vec<&PluginRegistration> = candidates
            .filter_map(|name| self.registrations.get(name))
            .filter(|reg| query.matches(reg))
            .collect();
        matched.sort_by(|a, b| a.name().cmp(b.name()));
        matched
    }

    /// Counts by status and capability.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.registrations.len(),
            ..RegistryStats::default()
        };
        for reg in self.registrations.values() {
            let slot = match reg.status {
                PluginStatus::Installed | PluginStatus::Discovered => &mut stats.installed,
                PluginStatus::Enabled => &mut stats.enabled,
                PluginStatus::Disabled => &mut stats.disabled,
                PluginStatus::Updating => &mut stats.updating,
                PluginStatus::Error => &mut stats.error,
            };
            *slot = slot.saturating_add(1);
        }
        for (cap, names) in &self.by_capability {
            stats.per_capability.insert(*cap, names.len());
        }
        stats
    }

    /// Current dependency graph snapshot.
    #[must_use]
    pub fn dependency_graph(&self) -> Arc<DependencyGraph> {
        Arc::clone(&self.graph)
    }

    /// Dependency report for a registered plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn check_dependencies(&self, name: &str) -> PluginResult<DependencyReport> {
        if !self.registrations.contains_key(name) {
            return Err(PluginError::NotFound(name.to_owned()));
        }
        Ok(resolver::check_dependencies(name, &self.manifest_index()))
    }

    /// Required dependencies of `name` that are missing or not enabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `name` is not registered.
    pub fn check_enabled_dependencies(&self, name: &str) -> PluginResult<Vec<String>> {
        let reg = self
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
        Ok(reg
            .required_dependencies()
            .filter(|dep| {
                self.registrations
                    .get(*dep)
                    .is_none_or(|d| d.status != PluginStatus::Enabled)
            })
            .map(str::to_owned)
            .collect())
    }

    /// Enabled plugins that require `name`, ordered by name.
    #[must_use]
    pub fn find_enabled_dependents(&self, name: &str) -> Vec<String> {
        self.dependents(name, |reg| reg.status == PluginStatus::Enabled)
    }

    /// Plugins of any status that require `name`, ordered by name.
    #[must_use]
    pub fn check_reverse_dependencies(&self, name: &str) -> Vec<String> {
        self.dependents(name, |_| true)
    }

    fn dependents(&self, name: &str, filter: impl Fn(&PluginRegistration) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .registrations
            .values()
            .filter(|reg| reg.name() != name && reg.requires(name) && filter(reg))
            .map(|reg| reg.name().to_owned())
            .collect();
        names.sort();
        names
    }

    /// Load persisted registrations, replacing same-named entries.
    ///
    /// Manifests are revalidated against the current host version; entries
    /// that no longer pass are restored in `error` status.
    pub fn restore(&mut self, registrations: impl IntoIterator<Item = PluginRegistration>) {
        for mut reg in registrations {
            let report = validate_manifest(&reg.manifest, &self.host_version);
            if !report.ok {
                let err = validation_error(reg.name().to_owned(), &report);
                warn!(plugin = %reg.name(), error = %err, "Restored plugin no longer validates");
                reg.status = PluginStatus::Error;
                reg.last_error = Some(err.to_string());
            }
            reg.capabilities = extract_capabilities(&reg.manifest);
            reg.dependencies = DependencySpec::from_manifest(&reg.manifest);
            self.registrations.insert(reg.name().to_owned(), reg);
        }
        self.rebuild();
        info!(count = self.registrations.len(), "Registry restored");
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.keys().cloned().collect();
        names.sort();
        names
    }

    fn manifest_index(&self) -> BTreeMap<&str, &PluginManifest> {
        self.registrations
            .iter()
            .map(|(name, reg)| (name.as_str(), &reg.manifest))
            .collect()
    }

    fn rebuild(&mut self) {
        self.by_capability.clear();
        self.by_author.clear();
        for (name, reg) in &self.registrations {
            for &cap in &reg.capabilities {
                self.by_capability
                    .entry(cap)
                    .or_default()
                    .insert(name.clone());
            }
            if let Some(author) = &reg.manifest.author {
                self.by_author
                    .entry(author.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }
        self.graph = Arc::new(DependencyGraph::build(self.registrations.values()));
        if !self.graph.cycles().is_empty() {
            warn!(cycles = ?self.graph.cycles(), "Dependency graph contains cycles");
        }
        debug!(
            plugins = self.registrations.len(),
            edges = self.graph.edges().len(),
            "Rebuilt registry indexes"
        );
    }
}

fn validation_error(plugin: String, report: &ValidationReport) -> PluginError {
    PluginError::Validation {
        plugin,
        issues: report.errors(),
    }
}

/// Whether `proposed` is a strictly greater semver than `current`.
fn is_newer(proposed: &str, current: &str) -> bool {
    match (Version::parse(proposed), Version::parse(current)) {
        (Ok(p), Ok(c)) => p > c,
        (Ok(_), Err(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PluginRegistry {
        PluginRegistry::new(Version::new(1, 0, 0))
    }

    fn geo(version: &str) -> PluginManifest {
        PluginManifest::new("geo", version)
            .with_author("maps-team")
            .contribute(Capability::FieldType, "latlng")
            .contribute(Capability::ViewProvider, "map")
    }

    #[test]
    fn test_register_installs() {
        let mut reg = registry();
        assert_eq!(reg.register(geo("1.0.0")).unwrap(), RegisterOutcome::Installed);
        let entry = reg.get("geo").unwrap();
        assert_eq!(entry.status, PluginStatus::Installed);
        assert_eq!(
            entry.capabilities,
            vec![Capability::ViewProvider, Capability::FieldType]
        );
        assert_eq!(reg.dependency_graph().len(), 1);
    }

    #[test]
    fn test_re_registration_is_idempotent() {
        let mut reg = registry();
        reg.register(geo("1.0.0")).unwrap();
        let installed_at = reg.get("geo").unwrap().installed_at;
        assert_eq!(reg.register(geo("1.0.0")).unwrap(), RegisterOutcome::Unchanged);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("geo").unwrap().installed_at, installed_at);
    }

    #[test]
    fn test_re_registration_with_new_version_updates() {
        let mut reg = registry();
        reg.register(geo("1.0.0")).unwrap();
        reg.set_status("geo", PluginStatus::Disabled).unwrap();
        let outcome = reg.register(geo("1.1.0")).unwrap();
        assert_eq!(
            outcome,
            RegisterOutcome::Updated {
                previous_version: "1.0.0".into()
            }
        );
        let entry = reg.get("geo").unwrap();
        assert_eq!(entry.version(), "1.1.0");
        assert_eq!(entry.status, PluginStatus::Disabled);
    }

    #[test]
    fn test_update_requires_greater_version() {
        let mut reg = registry();
        reg.register(geo("1.2.0")).unwrap();
        for version in ["1.2.0", "1.1.9"] {
            let err = reg.update(geo(version)).unwrap_err();
            assert!(matches!(err, PluginError::VersionNotGreater { .. }), "{err}");
        }
        assert!(matches!(
            reg.update(PluginManifest::new("ghost", "1.0.0")),
            Err(PluginError::NotFound(_))
        ));
        assert_eq!(reg.get("geo").unwrap().version(), "1.2.0");
    }

    #[test]
    fn test_update_preserves_config_and_times() {
        let mut reg = registry();
        reg.register(geo("1.0.0")).unwrap();
        let mut config = serde_json::Map::new();
        config.insert("zoom".into(), serde_json::json!(3));
        reg.set_config("geo", config.clone()).unwrap();
        reg.mark_activated("geo").unwrap();
        let before = reg.get("geo").unwrap().clone();

        reg.update(geo("2.0.0")).unwrap();
        let after = reg.get("geo").unwrap();
        assert_eq!(after.config, config);
        assert_eq!(after.installed_at, before.installed_at);
        assert_eq!(after.last_activated_at, before.last_activated_at);
        assert!(after.updated_at >= before.updated_at);
    }

    #[test]
    fn test_validation_failure() {
        let mut reg = registry();
        let err = reg
            .register(PluginManifest::new("geo", "1.0.0").with_host_version(">=2.0.0"))
            .unwrap_err();
        match err {
            PluginError::Validation { plugin, issues } => {
                assert_eq!(plugin, "geo");
                assert_eq!(issues[0].field, "host_version");
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn test_capability_conflict() {
        let mut reg = registry();
        let manifest = PluginManifest::new("sso", "1.0.0")
            .with_permission("*")
            .contribute(Capability::AuthProvider, "saml")
            .contribute(Capability::DataSource, "ldap");
        let err = reg.register(manifest).unwrap_err();
        assert!(matches!(err, PluginError::CapabilityConflict { ref conflicts, .. } if conflicts.len() == 2));
    }

    #[test]
    fn test_missing_permissions_cover_capability_closure() {
        let mut reg = registry();
        let manifest = PluginManifest::new("cron", "1.0.0")
            .with_permission("scheduler")
            .contribute(Capability::ScheduledJob, "nightly");
        let err = reg.register(manifest).unwrap_err();
        match err {
            PluginError::Permission { missing, .. } => {
                assert_eq!(missing, vec!["events.subscribe".to_owned(), "data.write".to_owned()]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut reg = registry();
        reg.register(PluginManifest::new("a", "1.0.0").with_dependency("b", "*"))
            .unwrap();
        let err = reg
            .register(PluginManifest::new("b", "1.0.0").with_dependency("a", "*"))
            .unwrap_err();
        match err {
            PluginError::Dependency { report, .. } => {
                assert_eq!(report.cycles, vec![vec!["a".to_owned(), "b".to_owned()]]);
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(reg.len(), 1);
        assert!(reg.dependency_graph().cycles().is_empty());
    }

    #[test]
    fn test_update_rejected_when_dependent_range_breaks() {
        let mut reg = registry();
        reg.register(PluginManifest::new("tiles", "2.0.0")).unwrap();
        reg.register(PluginManifest::new("geo", "1.0.0").with_dependency("tiles", "^2"))
            .unwrap();
        let err = reg.update(PluginManifest::new("tiles", "3.0.0")).unwrap_err();
        assert!(matches!(err, PluginError::Dependency { .. }));
        assert!(reg.update(PluginManifest::new("tiles", "2.1.0")).is_ok());
    }

    #[test]
    fn test_enabled_dependency_checks() {
        let mut reg = registry();
        reg.register(PluginManifest::new("tiles", "2.0.0")).unwrap();
        reg.register(
            PluginManifest::new("geo", "1.0.0")
                .with_dependency("tiles", "^2")
                .with_dependency("projections", "^1")
                .with_peer_dependency("charts", "*"),
        )
        .unwrap();

        assert_eq!(
            reg.check_enabled_dependencies("geo").unwrap(),
            vec!["projections".to_owned(), "tiles".to_owned()]
        );
        reg.set_status("tiles", PluginStatus::Enabled).unwrap();
        assert_eq!(
            reg.check_enabled_dependencies("geo").unwrap(),
            vec!["projections".to_owned()]
        );

        assert!(reg.find_enabled_dependents("tiles").is_empty());
        assert_eq!(reg.check_reverse_dependencies("tiles"), vec!["geo".to_owned()]);
        reg.set_status("geo", PluginStatus::Enabled).unwrap();
        assert_eq!(reg.find_enabled_dependents("tiles"), vec!["geo".to_owned()]);
    }

    #[test]
    fn test_query_and_stats() {
        let mut reg = registry();
        reg.register(geo("1.4.0")).unwrap();
        reg.register(PluginManifest::new("calc", "0.3.0").contribute(Capability::Formula, "sum2"))
            .unwrap();
        reg.set_status("calc", PluginStatus::Enabled).unwrap();

        let names = |q: &PluginQuery| -> Vec<String> {
            reg.query(q).iter().map(|r| r.name().to_owned()).collect()
        };
        assert_eq!(names(&PluginQuery::all()), vec!["calc", "geo"]);
        assert_eq!(names(&PluginQuery::all().with_capability(Capability::Formula)), vec!["calc"]);
        assert_eq!(names(&PluginQuery::all().with_author("maps-team")), vec!["geo"]);
        assert_eq!(names(&PluginQuery::all().with_status(PluginStatus::Enabled)), vec!["calc"]);
        assert_eq!(names(&PluginQuery::all().with_version_range("^1")), vec!["geo"]);
        assert!(names(&PluginQuery::all().with_name("nope")).is_empty());

        let stats = reg.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.installed, 1);
        assert_eq!(stats.per_capability.get(&Capability::FieldType), Some(&1));
    }

    #[test]
    fn test_mark_error_and_recover() {
        let mut reg = registry();
        reg.register(geo("1.0.0")).unwrap();
        reg.mark_error("geo", "boom").unwrap();
        let entry = reg.get("geo").unwrap();
        assert_eq!(entry.status, PluginStatus::Error);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
        assert_eq!(reg.dependency_graph().node("geo").unwrap().status, PluginStatus::Error);

        reg.set_status("geo", PluginStatus::Enabled).unwrap();
        assert!(reg.get("geo").unwrap().last_error.is_none());
    }

    #[test]
    fn test_restore_revalidates() {
        let mut source = registry();
        source.register(geo("1.0.0")).unwrap();
        source.register(PluginManifest::new("old", "1.0.0")).unwrap();
        let mut saved: Vec<PluginRegistration> =
            ["geo", "old"].iter().map(|n| source.get(n).unwrap().clone()).collect();
        saved[1].manifest.host_version = "<1.0.0".into();

        let mut reg = registry();
        reg.restore(saved);
        assert_eq!(reg.names(), vec!["geo", "old"]);
        assert_eq!(reg.get("geo").unwrap().status, PluginStatus::Installed);
        assert_eq!(reg.get("old").unwrap().status, PluginStatus::Error);
        assert_eq!(reg.query(&PluginQuery::all().with_author("maps-team")).len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut reg = registry();
        reg.register(geo("1.0.0")).unwrap();
        assert_eq!(reg.remove("geo").unwrap().name(), "geo");
        assert!(matches!(reg.remove("geo"), Err(PluginError::NotFound(_))));
        assert!(reg.dependency_graph().is_empty());
        assert!(reg.query(&PluginQuery::all().with_capability(Capability::FieldType)).is_empty());
    }
}
