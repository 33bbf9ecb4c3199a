//! Discovery and persistence integration tests.
//!
//! Lays out plugin directories on disk, loads them through the manager
//! (configured from a host config file), and restarts the manager against
//! the same state file.

use std::path::{Path, PathBuf};

use serde_json::json;
use tabula_config::Config;
use tabula_plugins::prelude::*;
use tabula_plugins::{FnHandler, NativeUnitFactory, PluginQuery};
use tempfile::TempDir;

fn write_plugin(root: &Path, dir: &str, manifest: &str) -> PathBuf {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.toml"), manifest).unwrap();
    dir
}

/// tiles ← geo, plus a native `calc` plugin and one broken manifest.
fn lay_out_plugins(root: &Path) {
    write_plugin(
        root,
        "tiles",
        r#"
name = "tiles"
version = "1.4.0"
host_version = "^1"

[contributes]
views = ["tile-grid"]
"#,
    );
    write_plugin(
        root,
        "geo",
        r#"
name = "geo"
version = "1.0.0"
host_version = "^1"
permissions = ["network"]

[contributes]
field_types = ["latlng"]
views = [{ id = "map", title = "Map" }]

[dependencies]
tiles = "^1.2"
"#,
    );
    write_plugin(
        root,
        "calc",
        r#"
name = "calc"
version = "0.3.0"
host_version = ">=1.0.0"

[contributes]
formulas = ["DISTANCE"]

[entry]
kind = "native"
"#,
    );
    write_plugin(root, "broken", "name = [");
}

fn native_units() -> NativeUnitFactory {
    NativeUnitFactory::new().with_unit("calc", |_| {
        Box::new(HandlerUnit::new().with_handler(
            Capability::Formula,
            FnHandler::new("distance", |req| {
                Ok(json!({ "fn": "DISTANCE", "args": req.payload }))
            }),
        ))
    })
}

fn write_config(dir: &Path, plugins: &Path, auto_enable: bool) -> PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        r#"
[host]
version = "1.3.0"

[plugins]
directories = [{plugins:?}]
state_file = {state:?}
auto_enable = {auto_enable}

[sandbox]
cpu_seconds = 5
"#,
        plugins = plugins.display().to_string(),
        state = dir.join("state").join("plugins.json").display().to_string(),
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn manager_from(config_path: &Path) -> PluginManager {
    let config = Config::load_file(config_path).unwrap();
    let settings = ManagerConfig::from_config(&config).unwrap();
    let loader = settings.loader().with_factory(native_units());
    PluginManager::builder(settings).with_loader(loader).build()
}

#[tokio::test]
async fn test_loads_and_auto_enables_in_dependency_order() {
    let tmp = TempDir::new().unwrap();
    let plugins = tmp.path().join("plugins");
    lay_out_plugins(&plugins);
    let mgr = manager_from(&write_config(tmp.path(), &plugins, true));
    assert_eq!(mgr.config().host_version.to_string(), "1.3.0");

    let summary = mgr.load_from_directories().await.unwrap();
    assert_eq!(summary.registered, vec!["calc", "tiles", "geo"]);
    assert_eq!(summary.enabled, vec!["calc", "tiles", "geo"]);
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);

    let out = mgr
        .invoke(
            Capability::Formula,
            CapabilityRequest::new("evaluate").with_payload(json!([1, 2])),
        )
        .await
        .unwrap();
    assert_eq!(out, json!({ "fn": "DISTANCE", "args": [1, 2] }));

    let graph = mgr.dependency_graph().await;
    let deps: Vec<&str> = graph
        .dependencies_of("geo")
        .into_iter()
        .map(|(node, _)| node.name.as_str())
        .collect();
    assert_eq!(deps, vec!["tiles"]);

    // Loading again finds nothing new.
    let again = mgr.load_from_directories().await.unwrap();
    assert_eq!(again.registered.len(), 3);
    assert!(again.enabled.is_empty());
}

#[tokio::test]
async fn test_discovered_plugin_failures_are_reported() {
    let tmp = TempDir::new().unwrap();
    let plugins = tmp.path().join("plugins");
    lay_out_plugins(&plugins);
    write_plugin(
        &plugins,
        "future",
        r#"
name = "future"
version = "1.0.0"
host_version = "^2"

[contributes]
commands = ["warp"]
"#,
    );
    let mgr = manager_from(&write_config(tmp.path(), &plugins, false));

    let summary = mgr.load_from_directories().await.unwrap();
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "future");
    assert!(summary.failed[0].1.contains("host_version"));
    assert!(summary.enabled.is_empty());
    assert!(mgr.get("future").await.is_none());

    let installed = mgr
        .query(&PluginQuery::all().with_status(PluginStatus::Installed))
        .await;
    assert_eq!(installed.len(), 3);
}

#[tokio::test]
async fn test_restart_restores_state_and_reactivates() {
    let tmp = TempDir::new().unwrap();
    let plugins = tmp.path().join("plugins");
    lay_out_plugins(&plugins);
    let config_path = write_config(tmp.path(), &plugins, true);

    {
        let mgr = manager_from(&config_path);
        let summary = mgr.init().await.unwrap();
        assert_eq!(summary.restored, 0);
        assert_eq!(summary.enabled, vec!["calc", "tiles", "geo"]);

        mgr.disable_plugin("calc").await.unwrap();
        let mut config = serde_json::Map::new();
        config.insert("zoom".into(), json!(12));
        mgr.set_plugin_config("geo", config).await.unwrap();

        mgr.shutdown().await;
        assert!(mgr.capabilities().counts().is_empty());
        assert_eq!(mgr.get("geo").await.unwrap().status, PluginStatus::Enabled);
        assert!(!mgr.is_persistence_degraded());
    }
    assert!(tmp.path().join("state").join("plugins.json").exists());

    let mgr = manager_from(&config_path);
    let summary = mgr.init().await.unwrap();
    assert_eq!(summary.restored, 3);
    assert_eq!(summary.enabled, vec!["tiles", "geo"]);
    assert!(summary.failed.is_empty(), "{:?}", summary.failed);

    assert_eq!(mgr.get("calc").await.unwrap().status, PluginStatus::Disabled);
    let geo = mgr.get("geo").await.unwrap();
    assert_eq!(geo.status, PluginStatus::Enabled);
    assert_eq!(geo.config.get("zoom"), Some(&json!(12)));
    assert_eq!(mgr.capabilities().providers(Capability::ViewProvider).len(), 2);

    // The restored native plugin gets its unit back from the loader.
    mgr.enable_plugin("calc").await.unwrap();
    let out = mgr
        .invoke(Capability::Formula, CapabilityRequest::new("evaluate"))
        .await
        .unwrap();
    assert_eq!(out["fn"], "DISTANCE");
}

#[tokio::test]
async fn test_uninstall_removes_persisted_state() {
    let tmp = TempDir::new().unwrap();
    let plugins = tmp.path().join("plugins");
    lay_out_plugins(&plugins);
    let config_path = write_config(tmp.path(), &plugins, false);

    {
        let mgr = manager_from(&config_path);
        mgr.init().await.unwrap();
        mgr.uninstall_plugin("calc").await.unwrap();
    }

    let mut config = Config::load_file(&config_path).unwrap();
    config.plugins.directories.clear();
    let settings = ManagerConfig::from_config(&config).unwrap();
    let mgr = PluginManager::new(settings);
    let summary = mgr.init().await.unwrap();
    assert_eq!(summary.restored, 2);
    assert!(mgr.get("calc").await.is_none());
    assert_eq!(mgr.stats().await.installed, 2);
}

#[tokio::test]
async fn test_unwritable_state_degrades_to_memory() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();

    let mgr = PluginManager::new(ManagerConfig {
        state_file: Some(blocker.join("plugins.json")),
        ..ManagerConfig::default()
    });
    let summary = mgr.init().await.unwrap();
    assert_eq!(summary.restored, 0);

    let manifest = PluginManifest::new("geo", "1.0.0").contribute(Capability::ViewProvider, "map");
    mgr.register_plugin(manifest).await.unwrap();
    mgr.enable_plugin("geo").await.unwrap();
    assert!(mgr.is_persistence_degraded());
    assert_eq!(mgr.get("geo").await.unwrap().status, PluginStatus::Enabled);
}
