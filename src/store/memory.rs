//! In-memory store for tests and host dry runs.

use super::{CredentialStore, StoreError};
use std::collections::HashMap;
use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Flag(bool),
}

/// Volatile [`CredentialStore`].
///
/// Records the order of writes and can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, Value>,
    write_log: Vec<String>,
    commits: usize,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write, erase and commit fail.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Keys in the order they were set.
    pub fn write_log(&self) -> &[String] {
        &self.write_log
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        Ok(())
    }

    fn put(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check_writable()?;
        self.values.insert(key.to_string(), value);
        self.write_log.push(key.to_string());
        Ok(())
    }
}

impl CredentialStore for MemoryStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.values.get(key) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Flag(_)) => Err(StoreError::Corrupt(format!("{} is not a string", key))),
            None => Ok(None),
        }
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, Value::Str(value.to_string()))
    }

    fn get_flag(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.values.get(key) {
            Some(Value::Flag(b)) => Ok(Some(*b)),
            Some(Value::Str(_)) => Err(StoreError::Corrupt(format!("{} is not a flag", key))),
            None => Ok(None),
        }
    }

    fn set_flag(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put(key, Value::Flag(value))
    }

    fn erase(&mut self, key: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.values.remove(key);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.check_writable()?;
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_is_corrupt() {
        let mut store = MemoryStore::new();
        store.set_flag("k", true).unwrap();
        assert!(matches!(store.get_str("k"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_erase_missing_key_ok() {
        let mut store = MemoryStore::new();
        assert!(store.erase("missing").is_ok());
    }
}
