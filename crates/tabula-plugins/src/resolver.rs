//! Plugin dependency resolution.
//!
//! Walks the required-dependency graph depth first from a target plugin,
//! collecting every problem instead of stopping at the first: cycles,
//! version conflicts, and missing required or optional (peer) dependencies.
//! Peers are version-checked when present but never traversed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::manifest::PluginManifest;

/// An installed dependency whose version does not satisfy a declared range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConflict {
    /// Plugin declaring the range.
    pub plugin: String,
    /// The dependency.
    pub dependency: String,
    /// Declared range.
    pub required: String,
    /// Installed version.
    pub actual: String,
}

/// A declared dependency that is not registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    /// Plugin declaring the dependency.
    pub plugin: String,
    /// The absent dependency.
    pub dependency: String,
}

/// Everything dependency resolution found for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
    /// Plugin the check started from.
    pub target: String,
    /// Cycles, each rotated to start at its smallest name.
    pub cycles: Vec<Vec<String>>,
    /// Range mismatches anywhere in the closure.
    pub version_conflicts: Vec<VersionConflict>,
    /// Required dependencies that are not registered.
    pub missing_required: Vec<MissingDependency>,
    /// Peer dependencies that are not registered.
    pub missing_optional: Vec<MissingDependency>,
}

impl DependencyReport {
    fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Cycles or version conflicts. These block registration; missing
    /// dependencies only block enabling.
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        !self.cycles.is_empty() || !self.version_conflicts.is_empty()
    }

    /// Nothing at all was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.has_fatal() && self.missing_required.is_empty() && self.missing_optional.is_empty()
    }

    /// One-line human readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_clean() {
            return "no dependency problems".to_owned();
        }
        let mut parts = Vec::new();
        for cycle in &self.cycles {
            let mut path = cycle.join(" -> ");
            if let Some(first) = cycle.first() {
                let _ = write!(path, " -> {first}");
            }
            parts.push(format!("cycle {path}"));
        }
        for c in &self.version_conflicts {
            parts.push(format!(
                "{} requires {} {} but {} is installed",
                c.plugin, c.dependency, c.required, c.actual
            ));
        }
        for m in &self.missing_required {
            parts.push(format!("{} requires missing {}", m.plugin, m.dependency));
        }
        for m in &self.missing_optional {
            parts.push(format!("{} peer {} is not installed", m.plugin, m.dependency));
        }
        parts.join("; ")
    }

    fn push_cycle(&mut self, mut cycle: Vec<String>) {
        if let Some(min) = cycle
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i)
        {
            cycle.rotate_left(min);
        }
        if !self.cycles.contains(&cycle) {
            self.cycles.push(cycle);
        }
    }
}

/// Check `target` and its required-dependency closure against `manifests`.
///
/// `manifests` must contain the target itself. A target that is absent
/// yields an empty report.
#[must_use]
pub fn check_dependencies(
    target: &str,
    manifests: &BTreeMap<&str, &PluginManifest>,
) -> DependencyReport {
    let mut walk = Walk::new(manifests, DependencyReport::new(target));
    walk.visit(target);
    walk.report
}

/// Dependency-first install order for a batch of manifests.
///
/// Only required dependencies present in the batch constrain the order;
/// ties are broken by name so the result is deterministic.
///
/// # Errors
///
/// Returns the report when the batch contains dependency cycles.
pub fn install_order(manifests: &[PluginManifest]) -> Result<Vec<String>, DependencyReport> {
    let map: BTreeMap<&str, &PluginManifest> =
        manifests.iter().map(|m| (m.name.as_str(), m)).collect();
    let mut walk = Walk::new(&map, DependencyReport::new("*"));
    for name in map.keys() {
        walk.visit(name);
    }
    if walk.report.cycles.is_empty() {
        Ok(walk.order.into_iter().map(str::to_owned).collect())
    } else {
        Err(walk.report)
    }
}

/// Registered plugins whose declared range on `name` rejects `version`.
///
/// Used before an update replaces `name`. Both required and peer ranges
/// are checked.
#[must_use]
pub fn dependents_rejecting(
    name: &str,
    version: &str,
    manifests: &BTreeMap<&str, &PluginManifest>,
) -> Vec<VersionConflict> {
    manifests
        .values()
        .filter(|m| m.name != name)
        .filter_map(|m| {
            let range = m
                .dependencies
                .get(name)
                .or_else(|| m.peer_dependencies.get(name))?;
            (!satisfies(range, version)).then(|| VersionConflict {
                plugin: m.name.clone(),
                dependency: name.to_owned(),
                required: range.clone(),
                actual: version.to_owned(),
            })
        })
        .collect()
}

/// Whether `version` satisfies `range`. Unparsable input never satisfies.
#[must_use]
pub fn satisfies(range: &str, version: &str) -> bool {
    match (VersionReq::parse(range), Version::parse(version)) {
        (Ok(req), Ok(ver)) => req.matches(&ver),
        _ => false,
    }
}

struct Walk<'a> {
    manifests: &'a BTreeMap<&'a str, &'a PluginManifest>,
    visiting: BTreeSet<&'a str>,
    visited: BTreeSet<&'a str>,
    stack: Vec<&'a str>,
    order: Vec<&'a str>,
    report: DependencyReport,
}

impl<'a> Walk<'a> {
    fn new(manifests: &'a BTreeMap<&'a str, &'a PluginManifest>, report: DependencyReport) -> Self {
        Self {
            manifests,
            visiting: BTreeSet::new(),
            visited: BTreeSet::new(),
            stack: Vec::new(),
            order: Vec::new(),
            report,
        }
    }

    fn visit(&mut self, name: &'a str) {
        if self.visited.contains(name) {
            return;
        }
        if self.visiting.contains(name) {
            if let Some(start) = self.stack.iter().position(|n| *n == name) {
                let cycle = self.stack[start..].iter().map(|n| (*n).to_owned()).collect();
                self.report.push_cycle(cycle);
            }
            return;
        }
        let Some(manifest) = self.manifests.get(name).copied() else {
            return;
        };

        self.visiting.insert(name);
        self.stack.push(name);

        for (dep, range) in &manifest.dependencies {
            match self.manifests.get(dep.as_str()).copied() {
                None => self.report.missing_required.push(MissingDependency {
                    plugin: name.to_owned(),
                    dependency: dep.clone(),
                }),
                Some(found) => {
                    self.check_version(name, found, range);
                    self.visit(found.name.as_str());
                },
            }
        }

        for (dep, range) in &manifest.peer_dependencies {
            match self.manifests.get(dep.as_str()).copied() {
                None => self.report.missing_optional.push(MissingDependency {
                    plugin: name.to_owned(),
                    dependency: dep.clone(),
                }),
                Some(found) => self.check_version(name, found, range),
            }
        }

        self.stack.pop();
        self.visiting.remove(name);
        self.visited.insert(name);
        self.order.push(name);
    }

    fn check_version(&mut self, plugin: &str, dependency: &PluginManifest, range: &str) {
        if satisfies(range, &dependency.version) {
            return;
        }
        let conflict = VersionConflict {
            plugin: plugin.to_owned(),
            dependency: dependency.name.clone(),
            required: range.to_owned(),
            actual: dependency.version.clone(),
        };
        if !self.report.version_conflicts.contains(&conflict) {
            self.report.version_conflicts.push(conflict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(manifests: &[PluginManifest]) -> BTreeMap<&str, &PluginManifest> {
        manifests.iter().map(|m| (m.name.as_str(), m)).collect()
    }

    #[test]
    fn test_clean_closure() {
        let manifests = vec![
            PluginManifest::new("geo", "1.0.0").with_dependency("tiles", "^2.0"),
            PluginManifest::new("tiles", "2.3.0").with_dependency("core", ">=1"),
            PluginManifest::new("core", "1.0.0"),
        ];
        let report = check_dependencies("geo", &index(&manifests));
        assert!(report.is_clean(), "{}", report.summary());
        assert_eq!(report.target, "geo");
    }

    #[test]
    fn test_reports_everything() {
        let manifests = vec![
            PluginManifest::new("geo", "1.0.0")
                .with_dependency("tiles", "^3.0")
                .with_dependency("projections", "^1")
                .with_peer_dependency("charts", "^1"),
            PluginManifest::new("tiles", "2.3.0"),
        ];
        let report = check_dependencies("geo", &index(&manifests));
        assert!(report.has_fatal());
        assert_eq!(report.version_conflicts.len(), 1);
        assert_eq!(report.version_conflicts[0].actual, "2.3.0");
        assert_eq!(report.missing_required[0].dependency, "projections");
        assert_eq!(report.missing_optional[0].dependency, "charts");
    }

    #[test]
    fn test_missing_required_alone_is_not_fatal() {
        let manifests = vec![PluginManifest::new("geo", "1.0.0").with_dependency("tiles", "^2")];
        let report = check_dependencies("geo", &index(&manifests));
        assert!(!report.has_fatal());
        assert!(!report.is_clean());
    }

    #[test]
    fn test_cycle_is_normalized() {
        let manifests = vec![
            PluginManifest::new("c", "1.0.0").with_dependency("a", "*"),
            PluginManifest::new("a", "1.0.0").with_dependency("b", "*"),
            PluginManifest::new("b", "1.0.0").with_dependency("c", "*"),
        ];
        let report = check_dependencies("b", &index(&manifests));
        assert_eq!(report.cycles, vec![vec!["a", "b", "c"]]);
        assert!(report.has_fatal());
        assert_eq!(report.summary(), "cycle a -> b -> c -> a");
    }

    #[test]
    fn test_cycle_does_not_stop_other_branches() {
        let manifests = vec![
            PluginManifest::new("a", "1.0.0")
                .with_dependency("b", "*")
                .with_dependency("z", "^2"),
            PluginManifest::new("b", "1.0.0").with_dependency("a", "*"),
            PluginManifest::new("z", "1.0.0"),
        ];
        let report = check_dependencies("a", &index(&manifests));
        assert_eq!(report.cycles.len(), 1);
        assert_eq!(report.version_conflicts.len(), 1);
    }

    #[test]
    fn test_peers_are_not_traversed() {
        let manifests = vec![
            PluginManifest::new("a", "1.0.0").with_peer_dependency("b", "*"),
            PluginManifest::new("b", "1.0.0").with_dependency("a", "*"),
        ];
        let report = check_dependencies("a", &index(&manifests));
        assert!(report.cycles.is_empty());
    }

    #[test]
    fn test_install_order_dependency_first() {
        let manifests = vec![
            PluginManifest::new("geo", "1.0.0").with_dependency("tiles", "*"),
            PluginManifest::new("alpha", "1.0.0"),
            PluginManifest::new("tiles", "1.0.0").with_dependency("core", "*"),
            PluginManifest::new("core", "1.0.0"),
        ];
        let order = install_order(&manifests).unwrap();
        assert_eq!(order, vec!["alpha", "core", "tiles", "geo"]);
    }

    #[test]
    fn test_install_order_rejects_cycles() {
        let manifests = vec![
            PluginManifest::new("a", "1.0.0").with_dependency("b", "*"),
            PluginManifest::new("b", "1.0.0").with_dependency("a", "*"),
        ];
        let report = install_order(&manifests).unwrap_err();
        assert_eq!(report.cycles, vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_dependents_rejecting() {
        let manifests = vec![
            PluginManifest::new("geo", "1.0.0").with_dependency("tiles", "^2"),
            PluginManifest::new("charts", "1.0.0").with_peer_dependency("tiles", ">=2"),
            PluginManifest::new("tiles", "2.0.0"),
        ];
        let map = index(&manifests);
        assert!(dependents_rejecting("tiles", "2.5.0", &map).is_empty());
        let conflicts = dependents_rejecting("tiles", "3.0.0", &map);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].plugin, "geo");
    }

    #[test]
    fn test_satisfies() {
        assert!(satisfies("^1.2", "1.4.0"));
        assert!(!satisfies("^1.2", "2.0.0"));
        assert!(!satisfies("garbage", "1.0.0"));
        assert!(!satisfies("*", "one"));
    }
}
