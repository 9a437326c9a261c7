//! Credential types captured during provisioning.
//!
//! These are platform-independent and host-testable.
//!
//! # Example
//!
//! ```
//! use device_provisioner::config::WifiCredentials;
//!
//! let creds = WifiCredentials::new("MyNetwork", "MyPassword").unwrap();
//! assert!(!creds.is_open());
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Station-mode credentials for joining the target network.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WifiCredentials {
    ssid: String,
    password: String,
}

impl WifiCredentials {
    /// Create validated credentials.
    pub fn new(
        ssid: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let creds = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        creds.validate()?;
        Ok(creds)
    }

    /// Credentials taken as given.
    ///
    /// Used for submitted and stored records; the radio rejects values it
    /// cannot represent when they are applied.
    pub fn unchecked(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// Validate SSID and password lengths.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.is_empty() {
            return Err(CredentialError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        // Empty is OK for open networks
        if !self.password.is_empty() && self.password.len() < MIN_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooShort {
                len: self.password.len(),
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        Ok(())
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the provisioning client submits, as persisted in the store.
///
/// Secrets are zeroed when the record is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceCredentialRecord {
    pub ssid: String,
    pub password: String,
    pub device_id: String,
    pub provisioning_token: String,
    /// Captured from the `Authorization` header, stored for later API calls.
    pub bearer_token: Option<String>,
    #[zeroize(skip)]
    pub provisioned: bool,
}

impl DeviceCredentialRecord {
    /// The station-mode part of the record, unvalidated.
    pub fn wifi(&self) -> WifiCredentials {
        WifiCredentials::unchecked(self.ssid.clone(), self.password.clone())
    }
}

impl fmt::Debug for DeviceCredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentialRecord")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("provisioning_token", &"<redacted>")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("provisioned", &self.provisioned)
            .finish()
    }
}

/// Errors from credential validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeviceCredentialRecord {
        DeviceCredentialRecord {
            ssid: "Net".to_string(),
            password: "pw123456".to_string(),
            device_id: "dev1".to_string(),
            provisioning_token: "tok1".to_string(),
            bearer_token: Some("secret-bearer".to_string()),
            provisioned: true,
        }
    }

    #[test]
    fn test_valid_credentials() {
        let creds = WifiCredentials::new("TestNetwork", "password123").unwrap();
        assert_eq!(creds.ssid(), "TestNetwork");
        assert_eq!(creds.password(), "password123");
        assert!(!creds.is_open());
    }

    #[test]
    fn test_open_network() {
        let creds = WifiCredentials::new("OpenNetwork", "").unwrap();
        assert!(creds.is_open());
    }

    #[test]
    fn test_empty_ssid() {
        assert_eq!(
            WifiCredentials::new("", "password123"),
            Err(CredentialError::SsidEmpty)
        );
    }

    #[test]
    fn test_ssid_length_limits() {
        assert!(WifiCredentials::new("a".repeat(32), "password123").is_ok());
        assert!(matches!(
            WifiCredentials::new("a".repeat(33), "password123"),
            Err(CredentialError::SsidTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_password_length_limits() {
        assert!(matches!(
            WifiCredentials::new("Net", "short"),
            Err(CredentialError::PasswordTooShort { .. })
        ));
        assert!(WifiCredentials::new("Net", "12345678").is_ok());
        assert!(WifiCredentials::new("Net", "a".repeat(64)).is_ok());
        assert!(matches!(
            WifiCredentials::new("Net", "a".repeat(65)),
            Err(CredentialError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug_str = format!("{:?}", record());
        assert!(debug_str.contains("Net"));
        assert!(debug_str.contains("dev1"));
        assert!(!debug_str.contains("pw123456"));
        assert!(!debug_str.contains("tok1"));
        assert!(!debug_str.contains("secret-bearer"));

        let creds = WifiCredentials::new("Net", "pw123456").unwrap();
        assert!(!format!("{:?}", creds).contains("pw123456"));
    }

    #[test]
    fn test_record_wifi_subset() {
        let creds = record().wifi();
        assert_eq!(creds.ssid(), "Net");
        assert_eq!(creds.password(), "pw123456");
    }

    #[test]
    fn test_unchecked_keeps_out_of_range_values() {
        let creds = WifiCredentials::unchecked("Net", "abc");
        assert_eq!(creds.password(), "abc");
        assert!(matches!(
            creds.validate(),
            Err(CredentialError::PasswordTooShort { len: 3, min: 8 })
        ));
    }
}
