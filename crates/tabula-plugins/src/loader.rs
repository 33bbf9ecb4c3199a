//! Plugin discovery and unit instantiation.
//!
//! The loader scans configured directories for manifest files, orders what
//! it finds so dependencies install first, and turns a manifest's `[entry]`
//! into an executable unit through the registered [`UnitFactory`]s.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::{EntryKind, PluginManifest};
use crate::resolver::install_order;
use crate::unit::{PluginUnit, UnitFactory};

/// Standard plugin manifest file name.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// A manifest found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPlugin {
    /// The parsed manifest.
    pub manifest: PluginManifest,
    /// Directory holding the manifest. Entry paths resolve against it.
    pub directory: PathBuf,
    /// Full path of the manifest file.
    pub manifest_path: PathBuf,
}

/// Finds manifests and instantiates units.
#[derive(Clone)]
pub struct PluginLoader {
    directories: Vec<PathBuf>,
    manifest_file: String,
    factories: HashMap<EntryKind, Arc<dyn UnitFactory>>,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.factories.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("PluginLoader")
            .field("directories", &self.directories)
            .field("manifest_file", &self.manifest_file)
            .field("factories", &kinds)
            .finish()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLoader {
    /// A loader with no directories and no factories.
    #[must_use]
    pub fn new() -> Self {
        Self {
            directories: Vec::new(),
            manifest_file: MANIFEST_FILE_NAME.to_owned(),
            factories: HashMap::new(),
        }
    }

    /// Scan `dir` as well.
    #[must_use]
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directories.push(dir.into());
        self
    }

    /// Scan every directory in `dirs` as well.
    #[must_use]
    pub fn with_directories(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.directories.extend(dirs);
        self
    }

    /// Look for manifests named `file_name` instead of `plugin.toml`.
    #[must_use]
    pub fn with_manifest_file(mut self, file_name: impl Into<String>) -> Self {
        self.manifest_file = file_name.into();
        self
    }

    /// Use `factory` for its entry kind, replacing any previous one.
    #[must_use]
    pub fn with_factory(mut self, factory: impl UnitFactory + 'static) -> Self {
        self.factories.insert(factory.kind(), Arc::new(factory));
        self
    }

    /// Configured directories.
    #[must_use]
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Manifest file name looked for.
    #[must_use]
    pub fn manifest_file(&self) -> &str {
        &self.manifest_file
    }

    /// Whether a factory is registered for `kind`.
    #[must_use]
    pub fn supports(&self, kind: EntryKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Discover manifests in every configured directory.
    ///
    /// Missing directories are skipped. Unreadable directories and
    /// manifests that fail to parse are logged and skipped. When two
    /// directories hold a plugin of the same name the first one wins.
    #[must_use]
    pub fn discover(&self) -> Vec<DiscoveredPlugin> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();

        for dir in &self.directories {
            if !dir.is_dir() {
                debug!(path = %dir.display(), "Plugin directory does not exist, skipping");
                continue;
            }
            info!(path = %dir.display(), "Discovering plugins");
            match load_manifests_from_dir(dir, &self.manifest_file) {
                Ok(plugins) => {
                    for plugin in plugins {
                        if seen.insert(plugin.manifest.name.clone()) {
                            found.push(plugin);
                        } else {
                            warn!(
                                plugin = %plugin.manifest.name,
                                path = %plugin.manifest_path.display(),
                                "Duplicate plugin name, keeping the first one found"
                            );
                        }
                    }
                },
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to read plugin directory");
                },
            }
        }

        info!(count = found.len(), "Discovered plugin manifests");
        found
    }

    /// Order `plugins` so every required dependency precedes its
    /// dependents. If the batch contains a cycle the order falls back to
    /// plain name order and registration will report the cycle.
    #[must_use]
    pub fn sort_for_install(mut plugins: Vec<DiscoveredPlugin>) -> Vec<DiscoveredPlugin> {
        let manifests: Vec<PluginManifest> = plugins.iter().map(|p| p.manifest.clone()).collect();
        match install_order(&manifests) {
            Ok(order) => {
                let rank: HashMap<&str, usize> = order
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (name.as_str(), i))
                    .collect();
                plugins.sort_by_key(|p| rank.get(p.manifest.name.as_str()).copied());
            },
            Err(report) => {
                warn!(cycles = %report.summary(), "Dependency cycle in discovered plugins");
                plugins.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
            },
        }
        plugins
    }

    /// Create the executable unit for `manifest`.
    ///
    /// Returns `Ok(None)` for declarative plugins without an `[entry]`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Activation`] when no factory handles the
    /// entry kind, or the factory's error.
    pub fn instantiate(
        &self,
        manifest: &PluginManifest,
        plugin_dir: &Path,
    ) -> PluginResult<Option<Box<dyn PluginUnit>>> {
        let Some(entry) = &manifest.entry else {
            return Ok(None);
        };
        let factory = self
            .factories
            .get(&entry.kind)
            .ok_or_else(|| PluginError::Activation {
                plugin: manifest.name.clone(),
                message: format!("no factory for {} units", entry.kind),
            })?;
        let unit = factory.create(manifest, plugin_dir)?;
        debug!(plugin = %manifest.name, kind = %entry.kind, "Unit instantiated");
        Ok(Some(unit))
    }
}

/// Load every manifest named `file_name` in `dir`: one directly inside it
/// and one in each direct subdirectory. Results are ordered by path.
///
/// # Errors
///
/// Returns [`PluginError::Io`] if `dir` cannot be read. Individual
/// manifests that fail to parse are logged and skipped.
pub fn load_manifests_from_dir(dir: &Path, file_name: &str) -> PluginResult<Vec<DiscoveredPlugin>> {
    let mut candidates = Vec::new();
    let root_manifest = dir.join(file_name);
    if root_manifest.is_file() {
        candidates.push((root_manifest, dir.to_path_buf()));
    }

    let mut subdirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    subdirs.sort();
    for sub in subdirs {
        let manifest_path = sub.join(file_name);
        if manifest_path.is_file() {
            candidates.push((manifest_path, sub));
        }
    }

    let mut found = Vec::with_capacity(candidates.len());
    for (manifest_path, directory) in candidates {
        match PluginManifest::load(&manifest_path) {
            Ok(manifest) => {
                debug!(
                    path = %manifest_path.display(),
                    plugin = %manifest.name,
                    "Loaded plugin manifest"
                );
                found.push(DiscoveredPlugin {
                    manifest,
                    directory,
                    manifest_path,
                });
            },
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "Failed to load plugin manifest");
            },
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::manifest::EntryPoint;
    use crate::unit::{HandlerUnit, NativeUnitFactory};

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), body).unwrap();
    }

    fn manifest_toml(name: &str, deps: &[(&str, &str)]) -> String {
        let mut body = format!("name = \"{name}\"\nversion = \"1.0.0\"\nhost_version = \"*\"\n");
        if !deps.is_empty() {
            body.push_str("\n[dependencies]\n");
            for (dep, range) in deps {
                body.push_str(&format!("{dep} = \"{range}\"\n"));
            }
        }
        body
    }

    #[test]
    fn test_load_manifests_from_dir_root_and_subdirs() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), &manifest_toml("root-plugin", &[]));
        write_manifest(&dir.path().join("b"), &manifest_toml("beta", &[]));
        write_manifest(&dir.path().join("a"), &manifest_toml("alpha", &[]));
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let found = load_manifests_from_dir(dir.path(), MANIFEST_FILE_NAME).unwrap();
        let names: Vec<&str> = found.iter().map(|p| p.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["root-plugin", "alpha", "beta"]);
        assert_eq!(found[1].directory, dir.path().join("a"));
        assert_eq!(found[1].manifest_path, dir.path().join("a").join(MANIFEST_FILE_NAME));
    }

    #[test]
    fn test_bad_manifest_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir.path().join("good"), &manifest_toml("good", &[]));
        write_manifest(&dir.path().join("bad"), "name = [not toml");

        let found = load_manifests_from_dir(dir.path(), MANIFEST_FILE_NAME).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.name, "good");
    }

    #[test]
    fn test_discover_skips_missing_dirs_and_duplicates() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_manifest(&first.path().join("geo"), &manifest_toml("geo", &[]));
        write_manifest(&second.path().join("geo"), &manifest_toml("geo", &[]));
        write_manifest(&second.path().join("tiles"), &manifest_toml("tiles", &[]));

        let loader = PluginLoader::new()
            .with_directory(first.path().join("missing"))
            .with_directory(first.path())
            .with_directory(second.path());
        let found = loader.discover();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].directory, first.path().join("geo"));
        assert_eq!(found[1].manifest.name, "tiles");
    }

    #[test]
    fn test_custom_manifest_file_name() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("calc");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(
            sub.join("manifest.json"),
            r#"{"name": "calc", "version": "0.2.0", "host_version": "*"}"#,
        )
        .unwrap();

        let loader = PluginLoader::new()
            .with_directory(dir.path())
            .with_manifest_file("manifest.json");
        let found = loader.discover();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.version, "0.2.0");
    }

    #[test]
    fn test_sort_for_install_puts_dependencies_first() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir.path().join("app"), &manifest_toml("app", &[("geo", "^1")]));
        write_manifest(&dir.path().join("geo"), &manifest_toml("geo", &[("tiles", "^1")]));
        write_manifest(&dir.path().join("tiles"), &manifest_toml("tiles", &[]));

        let found = load_manifests_from_dir(dir.path(), MANIFEST_FILE_NAME).unwrap();
        let sorted = PluginLoader::sort_for_install(found);
        let names: Vec<&str> = sorted.iter().map(|p| p.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["tiles", "geo", "app"]);
    }

    #[test]
    fn test_sort_for_install_with_cycle_falls_back_to_names() {
        let dir = TempDir::new().unwrap();
        write_manifest(&dir.path().join("b"), &manifest_toml("b", &[("a", "*")]));
        write_manifest(&dir.path().join("a"), &manifest_toml("a", &[("b", "*")]));
        write_manifest(&dir.path().join("c"), &manifest_toml("c", &[]));

        let found = load_manifests_from_dir(dir.path(), MANIFEST_FILE_NAME).unwrap();
        let sorted = PluginLoader::sort_for_install(found);
        let names: Vec<&str> = sorted.iter().map(|p| p.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_instantiate() {
        let loader = PluginLoader::new()
            .with_factory(NativeUnitFactory::new().with_unit("calc", |_| Box::new(HandlerUnit::new())));
        assert!(loader.supports(EntryKind::Native));
        assert!(!loader.supports(EntryKind::Wasm));

        let declarative = PluginManifest::new("geo", "1.0.0");
        assert!(loader.instantiate(&declarative, Path::new(".")).unwrap().is_none());

        let native = PluginManifest::new("calc", "1.0.0").with_entry(EntryPoint {
            kind: EntryKind::Native,
            path: None,
            hash: None,
        });
        assert!(loader.instantiate(&native, Path::new(".")).unwrap().is_some());

        let wasm = PluginManifest::new("calc", "1.0.0").with_entry(EntryPoint {
            kind: EntryKind::Wasm,
            path: Some("calc.wasm".into()),
            hash: None,
        });
        let err = loader.instantiate(&wasm, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("no factory for wasm units"));
    }
}
