//! Persistence of plugin registrations.
//!
//! The manager writes a registration through the provider after every
//! lifecycle change and reads them all back on startup. A provider failure
//! never fails the lifecycle operation; the manager logs it and keeps
//! running from memory.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::registration::PluginRegistration;

/// Current state file schema version.
const STATE_VERSION: u32 = 1;

/// Durable storage for registrations.
#[async_trait]
pub trait PersistenceProvider: Send + Sync + std::fmt::Debug {
    /// Every stored registration.
    async fn load(&self) -> PluginResult<Vec<PluginRegistration>>;

    /// Insert or replace one registration.
    async fn save(&self, registration: &PluginRegistration) -> PluginResult<()>;

    /// Remove a registration. Removing an unknown name is not an error.
    async fn delete(&self, name: &str) -> PluginResult<()>;
}

/// Keeps registrations in memory. State is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: RwLock<HashMap<String, PluginRegistration>>,
}

impl MemoryPersistence {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceProvider for MemoryPersistence {
    async fn load(&self) -> PluginResult<Vec<PluginRegistration>> {
        let mut regs: Vec<PluginRegistration> =
            self.entries.read().await.values().cloned().collect();
        regs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(regs)
    }

    async fn save(&self, registration: &PluginRegistration) -> PluginResult<()> {
        self.entries
            .write()
            .await
            .insert(registration.name().to_owned(), registration.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> PluginResult<()> {
        self.entries.write().await.remove(name);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    plugins: BTreeMap<String, PluginRegistration>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            plugins: BTreeMap::new(),
        }
    }
}

/// Stores every registration in one JSON file.
///
/// Each write loads the file, applies the change and replaces the file
/// atomically (temp file in the same directory, fsync, rename), all under
/// an exclusive lock on a `.lock` sibling so concurrent hosts sharing the
/// file do not lose each other's updates.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    /// Persist to `path`. Nothing is touched until the first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> PluginResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> PluginResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || f(&path))
            .await
            .map_err(|e| PluginError::Persistence(format!("persistence task failed: {e}")))?
    }
}

#[async_trait]
impl PersistenceProvider for FilePersistence {
    async fn load(&self) -> PluginResult<Vec<PluginRegistration>> {
        self.blocking(|path| {
            let state = read_state(path)?;
            Ok(state.plugins.into_values().collect())
        })
        .await
    }

    async fn save(&self, registration: &PluginRegistration) -> PluginResult<()> {
        let registration = registration.clone();
        self.blocking(move |path| {
            update_state(path, |state| {
                state
                    .plugins
                    .insert(registration.name().to_owned(), registration);
            })
        })
        .await
    }

    async fn delete(&self, name: &str) -> PluginResult<()> {
        let name = name.to_owned();
        self.blocking(move |path| {
            update_state(path, |state| {
                state.plugins.remove(&name);
            })
        })
        .await
    }
}

fn persistence_error(path: &Path, what: &str, e: impl std::fmt::Display) -> PluginError {
    PluginError::Persistence(format!("{what} {}: {e}", path.display()))
}

fn read_state(path: &Path) -> PluginResult<StateFile> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateFile::default()),
        Err(e) => return Err(persistence_error(path, "failed to read", e)),
    };
    let state: StateFile =
        serde_json::from_str(&content).map_err(|e| persistence_error(path, "failed to parse", e))?;
    if state.version != STATE_VERSION {
        return Err(PluginError::Persistence(format!(
            "unsupported state file version {} in {} (expected {STATE_VERSION})",
            state.version,
            path.display()
        )));
    }
    Ok(state)
}

fn update_state(path: &Path, f: impl FnOnce(&mut StateFile)) -> PluginResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| persistence_error(parent, "failed to create directory", e))?;

    let lock_path = path.with_extension("lock");
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| persistence_error(&lock_path, "failed to open", e))?;
    FileExt::lock_exclusive(&lock).map_err(|e| persistence_error(&lock_path, "failed to lock", e))?;

    let mut state = read_state(path)?;
    f(&mut state);

    let body = serde_json::to_vec_pretty(&state)
        .map_err(|e| persistence_error(path, "failed to serialize", e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| persistence_error(parent, "failed to create temp file in", e))?;
    tmp.write_all(&body)
        .map_err(|e| persistence_error(tmp.path(), "failed to write", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| persistence_error(tmp.path(), "failed to sync", e))?;
    tmp.persist(path)
        .map_err(|e| persistence_error(path, "failed to replace", e.error))?;

    debug!(path = %path.display(), plugins = state.plugins.len(), "Saved plugin state");
    // The lock is released when `lock` drops.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::manifest::PluginManifest;
    use crate::registration::PluginStatus;

    fn registration(name: &str, status: PluginStatus) -> PluginRegistration {
        let mut reg = PluginRegistration::new(PluginManifest::new(name, "1.0.0"));
        reg.status = status;
        reg
    }

    #[tokio::test]
    async fn test_memory_persistence() {
        let store = MemoryPersistence::new();
        store.save(&registration("b", PluginStatus::Installed)).await.unwrap();
        store.save(&registration("a", PluginStatus::Enabled)).await.unwrap();
        store.save(&registration("a", PluginStatus::Disabled)).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name(), "a");
        assert_eq!(loaded[0].status, PluginStatus::Disabled);

        store.delete("a").await.unwrap();
        store.delete("missing").await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("plugins.json");
        let store = FilePersistence::new(&path);
        assert!(store.load().await.unwrap().is_empty());

        let mut geo = registration("geo", PluginStatus::Enabled);
        geo.config
            .insert("zoom".into(), serde_json::Value::from(4));
        store.save(&geo).await.unwrap();
        store.save(&registration("tiles", PluginStatus::Installed)).await.unwrap();
        assert!(path.exists());

        let reopened = FilePersistence::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], geo);

        reopened.delete("geo").await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "tiles");
    }

    #[tokio::test]
    async fn test_file_persistence_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FilePersistence::new(&path);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, PluginError::Persistence(_)));
        assert!(store.save(&registration("geo", PluginStatus::Installed)).await.is_err());
    }

    #[tokio::test]
    async fn test_file_persistence_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, r#"{"version": 99, "plugins": {}}"#).unwrap();

        let err = FilePersistence::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("unsupported state file version 99"));
    }
}
