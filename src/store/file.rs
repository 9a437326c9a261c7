//! File-backed store for host (development) builds.
//!
//! Keeps the namespace as one JSON object in
//! `~/.device-provisioner/device_config.json`. Writes are buffered until
//! [`commit`](CredentialStore::commit), which rewrites the file and reads it
//! back to verify. A failed commit rolls the buffer back to the last
//! committed contents.

use super::{CredentialStore, StoreError, NAMESPACE};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// JSON-file [`CredentialStore`].
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Map<String, Value>,
    committed: Map<String, Value>,
}

impl FileStore {
    /// Default file location: `~/.device-provisioner/device_config.json`.
    pub fn default_path() -> io::Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(PathBuf::from(home)
            .join(".device-provisioner")
            .join(format!("{}.json", NAMESPACE)))
    }

    /// Open the store at the default location.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(Self::default_path()?)
    }

    /// Open the store at `path`, starting empty if the file does not exist.
    ///
    /// A file that is not a JSON object is discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!("Ignoring unreadable store file {:?}", path);
                    Map::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No store file at {:?}", path);
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            committed: values.clone(),
            values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.values.get(key) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::Corrupt(format!("{} is not a string", key))),
            None => Ok(None),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .insert(key.to_string(), Value::String(value.to_string()));
        Ok(())
    }

    fn get_flag(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.values.get(key) {
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(StoreError::Corrupt(format!("{} is not a flag", key))),
            None => Ok(None),
        }
    }

    fn set_flag(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), Value::Bool(value));
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        match self.write_verified() {
            Ok(()) => {
                self.committed = self.values.clone();
                info!("Store committed to {:?}", self.path);
                Ok(())
            }
            Err(e) => {
                warn!("Commit to {:?} failed, discarding staged writes", self.path);
                self.values = self.committed.clone();
                Err(e)
            }
        }
    }
}

impl FileStore {
    fn write_verified(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let text = serde_json::to_string_pretty(&self.values)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(&self.path, &text)?;

        // Verify write by reading back
        let read_back = fs::read_to_string(&self.path)?;
        if read_back != text {
            return Err(StoreError::Corrupt(format!(
                "verification failed: wrote {} bytes, read {} bytes",
                text.len(),
                read_back.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KEY_PROVISIONED, KEY_SSID};
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test files even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_store_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("provisioner-test-{}-{}.json", pid, id))
    }

    #[test]
    fn test_missing_file_is_empty() {
        let path = unique_store_path();
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_str(KEY_SSID).unwrap(), None);
        assert!(!store.is_provisioned().unwrap());
    }

    #[test]
    fn test_commit_persists_across_open() {
        let path = unique_store_path();

        let mut store = FileStore::open(&path).unwrap();
        store.set_str(KEY_SSID, "HomeNet").unwrap();
        store.set_flag(KEY_PROVISIONED, true).unwrap();
        store.commit().unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get_str(KEY_SSID).unwrap().as_deref(), Some("HomeNet"));
        assert!(reopened.is_provisioned().unwrap());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_uncommitted_writes_not_persisted() {
        let path = unique_store_path();

        let mut store = FileStore::open(&path).unwrap();
        store.set_str(KEY_SSID, "HomeNet").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get_str(KEY_SSID).unwrap(), None);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let dir = env::temp_dir().join(format!(
            "provisioner-test-dir-{}-{}",
            std::process::id(),
            TEST_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        let mut store = FileStore::open(dir.join("device_config.json")).unwrap();

        // Parent directory replaced by a plain file: every write fails
        fs::remove_dir_all(&dir).unwrap();
        fs::write(&dir, "not a directory").unwrap();

        let record = crate::test_support::valid_record();
        assert!(store.save_record(&record).is_err());
        assert!(!store.is_provisioned().unwrap());
        assert_eq!(store.get_str(KEY_SSID).unwrap(), None);

        let _ = fs::remove_file(&dir);
    }

    #[test]
    fn test_garbage_file_is_discarded() {
        let path = unique_store_path();
        fs::write(&path, "not json").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_str(KEY_SSID).unwrap(), None);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_wrong_type_is_corrupt() {
        let path = unique_store_path();
        fs::write(&path, r#"{"provisioned":"yes"}"#).unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(matches!(store.is_provisioned(), Err(StoreError::Corrupt(_))));

        let _ = fs::remove_file(&path);
    }
}
