//! Keyed blob persistence for the local store snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Key the local store snapshot is saved under.
pub const STORAGE_KEY: &str = "quickdesk-storage";

pub trait SnapshotStorage {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, blob: &str) -> Result<()>;
}

/// Process-local storage, for tests and for running without a data directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))?;
        Ok(blobs.get(key).cloned())
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".to_string()))?;
        blobs.insert(key.to_string(), blob.to_string());
        Ok(())
    }
}

impl<S: SnapshotStorage + ?Sized> SnapshotStorage for &S {
    fn load(&self, key: &str) -> Result<Option<String>> {
        (**self).load(key)
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        (**self).save(key, blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_loads_none() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load(STORAGE_KEY).unwrap(), None);
    }

    #[test]
    fn test_save_overwrites() {
        let storage = MemoryStorage::new();
        storage.save(STORAGE_KEY, "one").unwrap();
        storage.save(STORAGE_KEY, "two").unwrap();
        assert_eq!(storage.load(STORAGE_KEY).unwrap().as_deref(), Some("two"));
    }
}
