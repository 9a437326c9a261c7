//! Persistent key-value storage for provisioning state.
//!
//! Every value lives in one namespace and is written atomically per key; there
//! is no transaction spanning several keys. The provided methods on
//! [`CredentialStore`] build the record-level operations on top of the
//! per-key primitives and always write the `provisioned` flag last, so a
//! crash mid-save leaves the flag unset.
//!
//! # Backends
//!
//! - [`MemoryStore`] - tests and dry runs
//! - [`FileStore`] - host builds, JSON file under the home directory
//! - `NvsStore` - ESP32 non-volatile storage (`esp32` feature)

mod file;
mod memory;
#[cfg(feature = "esp32")]
mod nvs;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "esp32")]
pub use nvs::NvsStore;

use crate::collaborators::DeviceCertificates;
use crate::config::DeviceCredentialRecord;
use log::{debug, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Namespace holding every provisioning key.
pub const NAMESPACE: &str = "device_config";

pub const KEY_SSID: &str = "wifi_ssid";
pub const KEY_PASSWORD: &str = "wifi_pass";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_PROVISIONING_TOKEN: &str = "prov_token";
pub const KEY_BEARER_TOKEN: &str = "bearer_token";
pub const KEY_PROVISIONED: &str = "provisioned";
pub const KEY_DEVICE_CERT: &str = "device_cert";
pub const KEY_CA_CERT: &str = "ca_cert";

/// Keys making up a [`DeviceCredentialRecord`], flag excluded.
const RECORD_KEYS: [&str; 5] = [
    KEY_SSID,
    KEY_PASSWORD,
    KEY_DEVICE_ID,
    KEY_PROVISIONING_TOKEN,
    KEY_BEARER_TOKEN,
];

/// Key-value capability backing the provisioning state.
///
/// Implementations must make each `set_*`/`erase` durable on its own or on the
/// next [`commit`](CredentialStore::commit). Erasing a missing key succeeds.
pub trait CredentialStore: Send {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_flag(&self, key: &str) -> Result<Option<bool>, StoreError>;
    fn set_flag(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn erase(&mut self, key: &str) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Whether a complete credential record has been saved.
    fn is_provisioned(&self) -> Result<bool, StoreError> {
        Ok(self.get_flag(KEY_PROVISIONED)?.unwrap_or(false))
    }

    /// Persist a submitted record.
    ///
    /// A stale bearer token is erased when the record carries none.
    fn save_record(&mut self, record: &DeviceCredentialRecord) -> Result<(), StoreError> {
        self.set_str(KEY_SSID, &record.ssid)?;
        self.set_str(KEY_PASSWORD, &record.password)?;
        self.set_str(KEY_DEVICE_ID, &record.device_id)?;
        self.set_str(KEY_PROVISIONING_TOKEN, &record.provisioning_token)?;
        match &record.bearer_token {
            Some(token) => self.set_str(KEY_BEARER_TOKEN, token)?,
            None => self.erase(KEY_BEARER_TOKEN)?,
        }
        self.set_flag(KEY_PROVISIONED, true)?;
        self.commit()?;
        info!("Credentials saved for SSID '{}'", record.ssid);
        Ok(())
    }

    /// Load the saved record.
    ///
    /// Returns `Ok(None)` when the flag is unset and
    /// [`StoreError::Incomplete`] when the flag is set but a field is missing.
    fn load_record(&self) -> Result<Option<DeviceCredentialRecord>, StoreError> {
        if !self.is_provisioned()? {
            return Ok(None);
        }
        let required = |key: &'static str| -> Result<String, StoreError> {
            self.get_str(key)?
                .ok_or(StoreError::Incomplete { key })
        };
        Ok(Some(DeviceCredentialRecord {
            ssid: required(KEY_SSID)?,
            password: required(KEY_PASSWORD)?,
            device_id: required(KEY_DEVICE_ID)?,
            provisioning_token: required(KEY_PROVISIONING_TOKEN)?,
            bearer_token: self.get_str(KEY_BEARER_TOKEN)?,
            provisioned: true,
        }))
    }

    /// Bearer token captured at provisioning time, for later API calls.
    fn load_bearer_token(&self) -> Result<Option<String>, StoreError> {
        self.get_str(KEY_BEARER_TOKEN)
    }

    /// Erase every record field and the flag.
    ///
    /// The flag goes first so an interrupted clear never looks provisioned.
    fn clear_record(&mut self) -> Result<(), StoreError> {
        self.erase(KEY_PROVISIONED)?;
        for key in RECORD_KEYS {
            self.erase(key)?;
        }
        self.commit()?;
        info!("Provisioning record cleared");
        Ok(())
    }

    fn save_certificates(&mut self, certs: &DeviceCertificates) -> Result<(), StoreError> {
        self.set_str(KEY_DEVICE_CERT, &certs.certificate_pem)?;
        self.set_str(KEY_CA_CERT, &certs.ca_certificate_pem)?;
        self.commit()?;
        info!(
            "Certificates saved ({} + {} bytes)",
            certs.certificate_pem.len(),
            certs.ca_certificate_pem.len()
        );
        Ok(())
    }

    /// Both certificates, or `None` if either is missing.
    fn load_certificates(&self) -> Result<Option<DeviceCertificates>, StoreError> {
        let cert = self.get_str(KEY_DEVICE_CERT)?;
        let ca = self.get_str(KEY_CA_CERT)?;
        match (cert, ca) {
            (Some(certificate_pem), Some(ca_certificate_pem)) => Ok(Some(DeviceCertificates {
                certificate_pem,
                ca_certificate_pem,
            })),
            (None, None) => Ok(None),
            _ => {
                warn!("Only one of device/CA certificate stored, treating as absent");
                Ok(None)
            }
        }
    }

    fn has_certificates(&self) -> Result<bool, StoreError> {
        Ok(self.load_certificates()?.is_some())
    }

    /// Wipe the record and the certificates.
    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.clear_record()?;
        self.erase(KEY_DEVICE_CERT)?;
        self.erase(KEY_CA_CERT)?;
        self.commit()?;
        debug!("All provisioning keys erased");
        Ok(())
    }
}

/// Store shared between the HTTP handlers, the supervisor and the orchestrator.
pub type SharedStore = Arc<Mutex<dyn CredentialStore>>;

/// Wrap a backend for sharing.
pub fn shared<S: CredentialStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock the shared store.
///
/// A panic while holding the lock cannot leave a half-applied key, so the
/// poisoned guard is used as-is.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, dyn CredentialStore + 'static> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    /// The flag is set but a record field is missing.
    Incomplete { key: &'static str },
    /// A stored value has the wrong type or failed verification.
    Corrupt(String),
    /// Host file I/O failed.
    Io(std::io::Error),
    /// ESP-IDF NVS call failed.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete { key } => write!(f, "provisioning record incomplete: {} missing", key),
            Self::Corrupt(msg) => write!(f, "corrupt store: {}", msg),
            Self::Io(e) => write!(f, "store I/O error: {}", e),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "NVS error: {:?}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for StoreError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(bearer: Option<&str>) -> DeviceCredentialRecord {
        DeviceCredentialRecord {
            ssid: "HomeNet".to_string(),
            password: "secret123".to_string(),
            device_id: "dev-1".to_string(),
            provisioning_token: "tok-1".to_string(),
            bearer_token: bearer.map(str::to_string),
            provisioned: true,
        }
    }

    fn certs() -> DeviceCertificates {
        DeviceCertificates {
            certificate_pem: "-----BEGIN CERTIFICATE-----\nA\n".to_string(),
            ca_certificate_pem: "-----BEGIN CERTIFICATE-----\nB\n".to_string(),
        }
    }

    // ==================== Record Tests ====================

    #[test]
    fn test_fresh_store_not_provisioned() {
        let store = MemoryStore::new();
        assert!(!store.is_provisioned().unwrap());
        assert!(store.load_record().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_record() {
        let mut store = MemoryStore::new();
        store.save_record(&record(Some("bearer-x"))).unwrap();

        assert!(store.is_provisioned().unwrap());
        assert_eq!(store.load_record().unwrap(), Some(record(Some("bearer-x"))));
        assert_eq!(store.load_bearer_token().unwrap().as_deref(), Some("bearer-x"));
        assert!(store.commits() >= 1);
    }

    #[test]
    fn test_flag_written_last() {
        let mut store = MemoryStore::new();
        store.save_record(&record(None)).unwrap();
        let writes = store.write_log();
        assert_eq!(writes.last().map(String::as_str), Some(KEY_PROVISIONED));
    }

    #[test]
    fn test_save_without_bearer_erases_stale_token() {
        let mut store = MemoryStore::new();
        store.save_record(&record(Some("old"))).unwrap();
        store.save_record(&record(None)).unwrap();
        assert_eq!(store.load_bearer_token().unwrap(), None);
    }

    #[test]
    fn test_partial_record_is_incomplete() {
        let mut store = MemoryStore::new();
        store.save_record(&record(None)).unwrap();
        store.erase(KEY_DEVICE_ID).unwrap();

        match store.load_record() {
            Err(StoreError::Incomplete { key }) => assert_eq!(key, KEY_DEVICE_ID),
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn test_clear_record_removes_everything() {
        let mut store = MemoryStore::new();
        store.save_record(&record(Some("b"))).unwrap();
        store.clear_record().unwrap();

        assert!(!store.is_provisioned().unwrap());
        for key in RECORD_KEYS {
            assert_eq!(store.get_str(key).unwrap(), None, "{} survived", key);
        }
    }

    #[test]
    fn test_clear_keeps_certificates() {
        let mut store = MemoryStore::new();
        store.save_certificates(&certs()).unwrap();
        store.save_record(&record(None)).unwrap();
        store.clear_record().unwrap();
        assert!(store.has_certificates().unwrap());
    }

    #[test]
    fn test_save_failure_leaves_flag_unset() {
        let mut store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.save_record(&record(None)).is_err());
        store.set_fail_writes(false);
        assert!(!store.is_provisioned().unwrap());
    }

    // ==================== Certificate Tests ====================

    #[test]
    fn test_certificates_roundtrip() {
        let mut store = MemoryStore::new();
        assert!(!store.has_certificates().unwrap());
        store.save_certificates(&certs()).unwrap();
        assert_eq!(store.load_certificates().unwrap(), Some(certs()));
    }

    #[test]
    fn test_single_certificate_is_absent() {
        let mut store = MemoryStore::new();
        store.set_str(KEY_DEVICE_CERT, "cert").unwrap();
        assert!(!store.has_certificates().unwrap());
    }

    #[test]
    fn test_erase_all() {
        let mut store = MemoryStore::new();
        store.save_record(&record(Some("b"))).unwrap();
        store.save_certificates(&certs()).unwrap();
        store.erase_all().unwrap();

        assert!(!store.is_provisioned().unwrap());
        assert!(!store.has_certificates().unwrap());
        assert!(store.is_empty());
    }

    // ==================== Shared Store Tests ====================

    #[test]
    fn test_shared_store_survives_poison() {
        let store = shared(MemoryStore::new());
        let clone = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        lock(&store).set_flag(KEY_PROVISIONED, true).unwrap();
        assert!(lock(&store).is_provisioned().unwrap());
    }
}
