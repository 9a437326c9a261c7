//! NVS-backed store for ESP32.
//!
//! Every `set_*` and `erase` is committed by ESP-IDF before it returns, so
//! [`commit`](CredentialStore::commit) has nothing left to do.

use super::{CredentialStore, StoreError, NAMESPACE};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::debug;

/// [`CredentialStore`] over the default NVS partition.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    /// Open the provisioning namespace on the default partition.
    pub fn open(partition: EspNvsPartition<NvsDefault>) -> Result<Self, StoreError> {
        let nvs = EspNvs::new(partition, NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    /// Take the default partition and open the provisioning namespace.
    pub fn take() -> Result<Self, StoreError> {
        Self::open(EspNvsPartition::<NvsDefault>::take()?)
    }
}

impl CredentialStore for NvsStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        let len = match self.nvs.str_len(key)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len + 1];
        Ok(self.nvs.get_str(key, &mut buf)?.map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs.set_str(key, value)?;
        Ok(())
    }

    fn get_flag(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.nvs.get_u8(key)?.map(|v| v != 0))
    }

    fn set_flag(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.nvs.set_u8(key, u8::from(value))?;
        Ok(())
    }

    fn erase(&mut self, key: &str) -> Result<(), StoreError> {
        let existed = self.nvs.remove(key)?;
        debug!("NVS erase {} (existed: {})", key, existed);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
