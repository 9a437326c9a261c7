//! Provisioner configuration.
//!
//! - [`credentials`] - credentials captured from the provisioning client
//! - [`settings`] - runtime settings (access point, server, backend endpoints)

mod credentials;
mod settings;

pub use credentials::{
    CredentialError, DeviceCredentialRecord, WifiCredentials, MAX_PASSWORD_LEN, MAX_SSID_LEN,
    MIN_PASSWORD_LEN,
};
pub use settings::{
    ApSettings, ConfigError, ProvisionerConfig, DEFAULT_AP_IP, DEFAULT_AP_SSID, ENV_PREFIX,
};
