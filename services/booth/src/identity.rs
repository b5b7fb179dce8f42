//! Device identity.
//!
//! Each tablet claims the capture lock under an opaque id that is generated
//! once and then persisted in a local key-value store. The id is never rotated.

use crate::error::BoothError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

const DEVICE_ID_KEY: &str = "deviceId";

/// Local persistent key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, BoothError>;
    fn store(&self, key: &str, value: &str) -> Result<(), BoothError>;
}

/// Key-value pairs kept in a single JSON object file.
pub struct FileKeyValueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(path: &Path) -> Result<BTreeMap<String, String>, BoothError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BoothError::Infrastructure(format!("corrupt key-value file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(BoothError::Infrastructure(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn load(&self, key: &str) -> Result<Option<String>, BoothError> {
        let _guard = self.lock.lock();
        Ok(Self::read_all(&self.path)?.remove(key))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), BoothError> {
        let _guard = self.lock.lock();
        let mut entries = Self::read_all(&self.path)?;
        entries.insert(key.to_string(), value.to_string());

        let body = serde_json::to_vec_pretty(&entries)
            .map_err(|e| BoothError::Infrastructure(e.to_string()))?;

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                BoothError::Infrastructure(format!("failed to write {}: {e}", self.path.display()))
            })
    }
}

/// In-process key-value storage.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn load(&self, key: &str) -> Result<Option<String>, BoothError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<(), BoothError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Hands out this device's persistent identity.
pub struct DeviceIdentityProvider<S> {
    store: S,
}

impl<S: KeyValueStore> DeviceIdentityProvider<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Return the stored id, generating and persisting one on first use.
    pub fn device_id(&self) -> Result<String, BoothError> {
        if let Some(id) = self.store.load(DEVICE_ID_KEY)?.filter(|id| !id.is_empty()) {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        self.store.store(DEVICE_ID_KEY, &id)?;
        info!(device_id = %id, "Generated new device identity");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_generated_once() {
        let provider = DeviceIdentityProvider::new(MemoryKeyValueStore::default());
        let first = provider.device_id().unwrap();
        let second = provider.device_id().unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_injected_identity_is_used() {
        let store = MemoryKeyValueStore::default();
        store.store(DEVICE_ID_KEY, "tablet-a").unwrap();
        let provider = DeviceIdentityProvider::new(store);
        assert_eq!(provider.device_id().unwrap(), "tablet-a");
    }

    #[test]
    fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");

        let first = DeviceIdentityProvider::new(FileKeyValueStore::new(&path))
            .device_id()
            .unwrap();
        let second = DeviceIdentityProvider::new(FileKeyValueStore::new(&path))
            .device_id()
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_file_store_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(dir.path().join("kv.json"));
        store.store("a", "1").unwrap();
        store.store("b", "2").unwrap();
        assert_eq!(store.load("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.load("missing").unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, b"not json").unwrap();

        let provider = DeviceIdentityProvider::new(FileKeyValueStore::new(&path));
        assert!(matches!(provider.device_id(), Err(BoothError::Infrastructure(_))));
    }
}
