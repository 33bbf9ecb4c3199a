//! Manifest validation and capability extraction.
//!
//! Validation never fails fast: every problem found is reported as a
//! [`ValidationIssue`], and the report is `ok` only when none of them is an
//! error.

use std::fmt;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::manifest::PluginManifest;

/// How serious a validation issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Blocks registration.
    Error,
    /// Reported but not blocking.
    Warning,
}

/// One problem found in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Manifest field the issue concerns (dotted path).
    pub field: String,
    /// What is wrong.
    pub message: String,
    /// Error or warning.
    pub severity: IssueSeverity,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// No error-severity issues.
    pub ok: bool,
    /// Every issue found.
    pub issues: Vec<ValidationIssue>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            ok: true,
            issues: Vec::new(),
        }
    }
}

impl ValidationReport {
    /// Record an error.
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.ok = false;
        self.issues.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: IssueSeverity::Error,
        });
    }

    /// Record a warning.
    pub fn warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
            severity: IssueSeverity::Warning,
        });
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.ok = self.ok && other.ok;
        self.issues.extend(other.issues);
    }

    /// Error-severity issues.
    #[must_use]
    pub fn errors(&self) -> Vec<ValidationIssue> {
        self.by_severity(IssueSeverity::Error)
    }

    /// Warning-severity issues.
    #[must_use]
    pub fn warnings(&self) -> Vec<ValidationIssue> {
        self.by_severity(IssueSeverity::Warning)
    }

    fn by_severity(&self, severity: IssueSeverity) -> Vec<ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == severity)
            .cloned()
            .collect()
    }
}

/// Whether `name` is a valid plugin name: non-empty, lowercase ASCII
/// alphanumerics and hyphens, not starting or ending with a hyphen.
#[must_use]
pub fn is_valid_plugin_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Validate a manifest against the running host version.
#[must_use]
pub fn validate_manifest(manifest: &PluginManifest, host_version: &Version) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.name.is_empty() {
        report.error("name", "name is required");
    } else if !is_valid_plugin_name(&manifest.name) {
        report.error(
            "name",
            format!(
                "'{}' must contain only lowercase alphanumerics and hyphens",
                manifest.name
            ),
        );
    }

    if manifest.version.is_empty() {
        report.error("version", "version is required");
    } else if let Err(e) = Version::parse(&manifest.version) {
        report.error(
            "version",
            format!("'{}' is not a semantic version: {e}", manifest.version),
        );
    }

    if manifest.host_version.is_empty() {
        report.error("host_version", "required host version range is missing");
    } else {
        match VersionReq::parse(&manifest.host_version) {
            Ok(req) if !req.matches(host_version) => report.error(
                "host_version",
                format!(
                    "host {host_version} does not satisfy '{}'",
                    manifest.host_version
                ),
            ),
            Ok(_) => {},
            Err(e) => report.error(
                "host_version",
                format!("'{}' is not a version range: {e}", manifest.host_version),
            ),
        }
    }

    for (section, deps) in [
        ("dependencies", &manifest.dependencies),
        ("peer_dependencies", &manifest.peer_dependencies),
    ] {
        for (dep, range) in deps {
            let field = format!("{section}.{dep}");
            if dep == &manifest.name {
                report.error(&field, "a plugin cannot depend on itself");
            }
            if !is_valid_plugin_name(dep) {
                report.error(&field, format!("'{dep}' is not a valid plugin name"));
            }
            if let Err(e) = VersionReq::parse(range) {
                report.error(&field, format!("'{range}' is not a version range: {e}"));
            }
        }
    }

    for dep in manifest.peer_dependencies.keys() {
        if manifest.dependencies.contains_key(dep) {
            report.warning(
                format!("peer_dependencies.{dep}"),
                "also listed as a required dependency; the peer entry is redundant",
            );
        }
    }

    if manifest.permissions.iter().any(|p| p.trim().is_empty()) {
        report.warning("permissions", "blank permission entries are ignored");
    }

    if manifest.contributes.is_empty() {
        report.warning("contributes", "plugin contributes nothing");
    }

    report
}

/// Capabilities a manifest claims: one per non-empty contribution list,
/// in declaration order.
#[must_use]
pub fn extract_capabilities(manifest: &PluginManifest) -> Vec<Capability> {
    Capability::ALL
        .into_iter()
        .filter(|&cap| !manifest.contributes.list(cap).is_empty())
        .collect()
}

/// Check that `manifest` structurally supports `capability`.
///
/// The backing contribution list must be non-empty. Soft requirements are
/// reported as warnings.
#[must_use]
pub fn validate_capability_implementation(
    manifest: &PluginManifest,
    capability: Capability,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let field = format!("contributes.{}", capability.as_str().replace('-', "_"));
    let list = manifest.contributes.list(capability);

    if list.is_empty() {
        report.error(&field, format!("{capability} requires at least one contribution"));
    }
    if list.iter().any(|c| c.id().trim().is_empty()) {
        report.error(&field, "contribution ids must not be empty");
    }

    match capability {
        Capability::SettingsPage if manifest.contributes.configuration.is_none() => {
            report.warning(
                "contributes.configuration",
                "settings-page should declare a configuration schema",
            );
        },
        Capability::DataSource => {
            let perms = manifest.permission_set();
            if !perms.allows("network") && !perms.allows("database") {
                report.warning(
                    "permissions",
                    "data-source declares neither network nor database access",
                );
            }
        },
        _ => {},
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Version {
        Version::new(1, 2, 0)
    }

    #[test]
    fn test_valid_manifest() {
        let manifest = PluginManifest::new("geo", "1.0.0")
            .with_host_version(">=1.0.0")
            .contribute(Capability::FieldType, "latlng");
        let report = validate_manifest(&manifest, &host());
        assert!(report.ok, "{:?}", report.issues);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_reports_all_problems_at_once() {
        let manifest = PluginManifest {
            name: "Geo Plugin".to_owned(),
            version: "one".to_owned(),
            host_version: String::new(),
            ..PluginManifest::default()
        };
        let report = validate_manifest(&manifest, &host());
        assert!(!report.ok);
        let errors = report.errors();
        let fields: Vec<&str> = errors.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"version"));
        assert!(fields.contains(&"host_version"));
        assert_eq!(report.warnings().len(), 1);
    }

    #[test]
    fn test_host_version_unsatisfied() {
        let manifest = PluginManifest::new("geo", "1.0.0")
            .with_host_version(">=2.0.0")
            .contribute(Capability::FieldType, "latlng");
        let report = validate_manifest(&manifest, &host());
        assert!(!report.ok);
        assert_eq!(report.errors()[0].field, "host_version");
    }

    #[test]
    fn test_bad_dependency_ranges_and_self_dependency() {
        let manifest = PluginManifest::new("geo", "1.0.0")
            .with_dependency("geo", "^1")
            .with_peer_dependency("tiles", "not a range")
            .contribute(Capability::FieldType, "latlng");
        let report = validate_manifest(&manifest, &host());
        let errors = report.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "dependencies.geo");
        assert_eq!(errors[1].field, "peer_dependencies.tiles");
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let manifest = PluginManifest::new("geo", "1.0.0").with_permission("");
        let report = validate_manifest(&manifest, &host());
        assert!(report.ok);
        assert_eq!(report.warnings().len(), 2);
    }

    #[test]
    fn test_plugin_names() {
        assert!(is_valid_plugin_name("geo"));
        assert!(is_valid_plugin_name("geo-maps-2"));
        assert!(!is_valid_plugin_name(""));
        assert!(!is_valid_plugin_name("-geo"));
        assert!(!is_valid_plugin_name("geo-"));
        assert!(!is_valid_plugin_name("Geo"));
        assert!(!is_valid_plugin_name("../geo"));
    }

    #[test]
    fn test_extract_capabilities_in_declaration_order() {
        let manifest = PluginManifest::new("geo", "1.0.0")
            .contribute(Capability::SettingsPage, "geo-settings")
            .contribute(Capability::FieldType, "latlng")
            .contribute(Capability::ViewProvider, "map");
        assert_eq!(
            extract_capabilities(&manifest),
            vec![
                Capability::ViewProvider,
                Capability::FieldType,
                Capability::SettingsPage
            ]
        );
        assert!(extract_capabilities(&PluginManifest::new("empty", "1.0.0")).is_empty());
    }

    #[test]
    fn test_capability_implementation_requires_contribution() {
        let manifest = PluginManifest::new("geo", "1.0.0").contribute(Capability::FieldType, "latlng");
        assert!(validate_capability_implementation(&manifest, Capability::FieldType).ok);

        let report = validate_capability_implementation(&manifest, Capability::ViewProvider);
        assert!(!report.ok);
        assert_eq!(report.errors()[0].field, "contributes.view_provider");
    }

    #[test]
    fn test_settings_page_without_schema_warns() {
        let manifest =
            PluginManifest::new("geo", "1.0.0").contribute(Capability::SettingsPage, "settings");
        let report = validate_capability_implementation(&manifest, Capability::SettingsPage);
        assert!(report.ok);
        assert_eq!(report.warnings()[0].field, "contributes.configuration");
    }

    #[test]
    fn test_data_source_without_access_warns() {
        let manifest =
            PluginManifest::new("pg", "1.0.0").contribute(Capability::DataSource, "postgres");
        let report = validate_capability_implementation(&manifest, Capability::DataSource);
        assert!(report.ok);
        assert_eq!(report.warnings().len(), 1);

        let manifest = manifest.with_permission("database");
        let report = validate_capability_implementation(&manifest, Capability::DataSource);
        assert!(report.warnings().is_empty());
    }
}
