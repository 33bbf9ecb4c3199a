//! Environment variable fallbacks.
//!
//! Env vars are **fallback**, not override: they only apply to fields that
//! no config file set. A value that only comes from the embedded defaults
//! can still be replaced by the environment.

use std::collections::HashMap;

use tracing::debug;

use crate::merge::{ConfigLayer, FieldSources};

/// How an env var's string value becomes a TOML value.
#[derive(Debug, Clone, Copy)]
enum EnvKind {
    String,
    Bool,
    PathList,
}

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: EnvKind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "TABULA_HOST_VERSION",
        field_path: "host.version",
        kind: EnvKind::String,
    },
    EnvMapping {
        var_name: "TABULA_PLUGIN_DIRS",
        field_path: "plugins.directories",
        kind: EnvKind::PathList,
    },
    EnvMapping {
        var_name: "TABULA_STATE_FILE",
        field_path: "plugins.state_file",
        kind: EnvKind::String,
    },
    EnvMapping {
        var_name: "TABULA_AUTO_ENABLE",
        field_path: "plugins.auto_enable",
        kind: EnvKind::Bool,
    },
    EnvMapping {
        var_name: "TABULA_LOG_LEVEL",
        field_path: "logging.level",
        kind: EnvKind::String,
    },
    EnvMapping {
        var_name: "TABULA_LOG_FORMAT",
        field_path: "logging.format",
        kind: EnvKind::String,
    },
];

/// Snapshot all `TABULA_*` environment variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("TABULA_"))
        .collect()
}

/// Apply environment variable fallbacks to fields that were **not** set by
/// any config file layer.
///
/// Returns the number of env vars applied.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if !matches!(
            sources.get(mapping.field_path),
            None | Some(ConfigLayer::Defaults)
        ) {
            continue;
        }

        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        let Some(value) = coerce(mapping.kind, raw) else {
            debug!(var = mapping.var_name, "ignoring unparsable env var");
            continue;
        };

        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        if set_field(merged, mapping.field_path, value) {
            sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
            count = count.saturating_add(1);
        }
    }

    count
}

fn coerce(kind: EnvKind, raw: &str) -> Option<toml::Value> {
    match kind {
        EnvKind::String => Some(toml::Value::String(raw.to_owned())),
        EnvKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Some(toml::Value::Boolean(false)),
            _ => None,
        },
        EnvKind::PathList => Some(toml::Value::Array(
            std::env::split_paths(raw)
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| toml::Value::String(p.display().to_string()))
                .collect(),
        )),
    }
}

/// Set a dotted path in the TOML tree, creating intermediate tables.
/// Returns false if a non-table value sits on the path.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) -> bool {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return false;
    };

    let mut current = root;
    for segment in segments {
        let Some(table) = current.as_table_mut() else {
            return false;
        };
        current = table
            .entry(segment.to_owned())
            .or_insert(toml::Value::Table(toml::map::Map::new()));
    }

    match current.as_table_mut() {
        Some(table) => {
            table.insert(leaf.to_owned(), value);
            true
        },
        None => false,
    }
}
