//! Finding and merging configuration layers.
//!
//! Files are merged as raw TOML trees so a section a layer leaves out keeps
//! the value from below. The tree is turned into a [`Config`] and validated
//! once, after the environment fallbacks have been applied.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::types::Config;
use crate::validate;

const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Files above this size are refused.
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

const SYSTEM_CONFIG: &str = "/etc/tabula/config.toml";
const CONFIG_DIR: &str = ".tabula";
const CONFIG_FILE: &str = "config.toml";

/// The merged configuration plus where each value came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Merged and validated configuration.
    pub config: Config,
    /// Dotted field path → layer that last set it.
    pub field_sources: FieldSources,
    /// Files that existed and were merged, lowest precedence first.
    pub loaded_files: Vec<PathBuf>,
}

impl ResolvedConfig {
    /// Layer that set `field`, e.g. `"sandbox.cpu_seconds"`.
    #[must_use]
    pub fn source_of(&self, field: &str) -> Option<ConfigLayer> {
        self.field_sources.get(field).copied()
    }

    /// Fields set by `layer`, sorted.
    #[must_use]
    pub fn fields_from(&self, layer: ConfigLayer) -> Vec<&str> {
        let mut fields: Vec<&str> = self
            .field_sources
            .iter()
            .filter(|(_, l)| **l == layer)
            .map(|(field, _)| field.as_str())
            .collect();
        fields.sort_unstable();
        fields
    }
}

/// Candidate files for each layer, lowest precedence first.
#[must_use]
pub fn layer_paths(workspace_root: Option<&Path>, home: &Path) -> Vec<(PathBuf, ConfigLayer)> {
    let mut layers = vec![
        (PathBuf::from(SYSTEM_CONFIG), ConfigLayer::System),
        (home.join(CONFIG_DIR).join(CONFIG_FILE), ConfigLayer::User),
    ];
    if let Some(root) = workspace_root {
        layers.push((root.join(CONFIG_DIR).join(CONFIG_FILE), ConfigLayer::Workspace));
    }
    layers
}

/// Resolve every layer. Without `home_override` the user's home directory
/// is looked up; without `workspace_root` the workspace layer is skipped.
///
/// # Errors
///
/// Fails on an unreadable, oversized or malformed layer, or when the merged
/// result does not validate.
pub fn load(workspace_root: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let home = match home_override {
        Some(home) => home.to_path_buf(),
        None => home_directory()?,
    };

    let mut tree: toml::Value = parse(DEFAULTS_TOML, Path::new("<defaults>"))?;
    let mut field_sources = FieldSources::new();
    record_leaves(&tree, "", ConfigLayer::Defaults, &mut field_sources);

    let mut loaded_files = Vec::new();
    for (path, layer) in layer_paths(workspace_root, &home) {
        let Some(content) = read_capped(&path)? else {
            debug!(path = %path.display(), %layer, "No config file for layer");
            continue;
        };
        let overlay: toml::Value = parse(&content, &path)?;
        deep_merge_tracking(&mut tree, &overlay, "", layer, &mut field_sources);
        info!(path = %path.display(), %layer, "Merged config layer");
        loaded_files.push(path);
    }

    let applied = apply_env_fallbacks(&mut tree, &mut field_sources, &collect_env_vars());
    if applied > 0 {
        debug!(count = applied, "Applied environment fallbacks");
    }

    let config: Config = tree.try_into().map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<merged>"),
        source,
    })?;
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Read and validate a single file.
///
/// # Errors
///
/// Fails if the file is missing, unreadable, oversized or malformed, or
/// does not validate.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let content = read_capped(path)?.ok_or_else(|| ConfigError::Read {
        path: path.to_path_buf(),
        source: io::ErrorKind::NotFound.into(),
    })?;
    let config: Config = parse(&content, path)?;
    validate::validate(&config)?;
    Ok(config)
}

/// File contents, or `None` if there is no such file. A single read, so
/// there is no window between an existence check and the read.
fn read_capped(path: &Path) -> ConfigResult<Option<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        },
    };
    let len = u64::try_from(content.len()).unwrap_or(u64::MAX);
    if len > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            len,
            limit: MAX_CONFIG_FILE_SIZE,
        });
    }
    Ok(Some(content))
}

fn parse<T: DeserializeOwned>(content: &str, path: &Path) -> ConfigResult<T> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
