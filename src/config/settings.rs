//! Runtime settings for the provisioner.
//!
//! Values come from a key lookup so the same parser serves the host (runtime
//! environment) and the device (values baked in at compile time).

use crate::orchestrator::Timings;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// SSID broadcast by the provisioning access point.
pub const DEFAULT_AP_SSID: &str = "Device-Setup";

/// 2.4 GHz channel used by the provisioning access point.
pub const DEFAULT_AP_CHANNEL: u8 = 1;

/// Maximum simultaneous clients on the provisioning access point.
pub const DEFAULT_AP_MAX_CONNECTIONS: u8 = 4;

/// Address the provisioning HTTP server listens on.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:80";

/// Handler threads sharing the provisioning listener.
pub const DEFAULT_HTTP_WORKERS: usize = 2;

/// Upper bound for a forced scan triggered by an HTTP request.
pub const DEFAULT_SCAN_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Address the access point hands out for itself.
pub const DEFAULT_AP_IP: [u8; 4] = [192, 168, 4, 1];

/// Environment variable prefix for every setting.
pub const ENV_PREFIX: &str = "PROVISIONER_";

/// Access point parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApSettings {
    pub ssid: String,
    /// Empty means an open access point.
    pub password: String,
    pub channel: u8,
    pub max_connections: u8,
}

impl ApSettings {
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl Default for ApSettings {
    fn default() -> Self {
        Self {
            ssid: DEFAULT_AP_SSID.to_string(),
            password: String::new(),
            channel: DEFAULT_AP_CHANNEL,
            max_connections: DEFAULT_AP_MAX_CONNECTIONS,
        }
    }
}

/// Complete provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub ap: ApSettings,
    pub bind_addr: SocketAddr,
    pub http_workers: usize,
    pub scan_refresh_timeout: Duration,
    pub timings: Timings,
    /// Base URL of the certificate signing backend.
    pub backend_url: String,
    /// mTLS broker URI for the messaging client.
    pub broker_uri: String,
    /// Reachability target: a URL on the device, `host:port` on the host.
    pub probe_target: String,
    /// Directory holding pre-issued certificates for the host issuer.
    pub cert_dir: Option<PathBuf>,
    /// Certificate signing request sent to the backend.
    pub csr_pem: Option<String>,
    /// Private key matching `csr_pem`, used for the mTLS session.
    pub key_pem: Option<String>,
    /// Wipe all provisioning state at startup (development builds).
    pub erase_on_boot: bool,
    /// SSIDs the simulated host radio reports as visible.
    pub host_networks: Vec<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            ap: ApSettings::default(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            http_workers: DEFAULT_HTTP_WORKERS,
            scan_refresh_timeout: DEFAULT_SCAN_REFRESH_TIMEOUT,
            timings: Timings::default(),
            backend_url: "http://localhost:8000".to_string(),
            broker_uri: "mqtts://localhost:8883".to_string(),
            probe_target: "https://example.com/".to_string(),
            cert_dir: None,
            csr_pem: None,
            key_pem: None,
            erase_on_boot: false,
            host_networks: vec!["HomeNet".to_string(), "Office".to_string()],
        }
    }
}

impl ProvisionerConfig {
    /// Build a configuration from a key lookup.
    ///
    /// Keys are the setting names without [`ENV_PREFIX`], e.g. `AP_SSID`.
    /// Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ssid) = lookup("AP_SSID") {
            if ssid.is_empty() || ssid.len() > crate::config::MAX_SSID_LEN {
                return Err(ConfigError::Invalid {
                    key: "AP_SSID",
                    value: ssid,
                });
            }
            config.ap.ssid = ssid;
        }
        if let Some(password) = lookup("AP_PASSWORD") {
            if !password.is_empty()
                && (password.len() < crate::config::MIN_PASSWORD_LEN
                    || password.len() > crate::config::MAX_PASSWORD_LEN)
            {
                return Err(ConfigError::Invalid {
                    key: "AP_PASSWORD",
                    value: "<redacted>".to_string(),
                });
            }
            config.ap.password = password;
        }
        if let Some(channel) = parse_key::<u8, _>(&lookup, "AP_CHANNEL")? {
            if !(1..=13).contains(&channel) {
                return Err(ConfigError::Invalid {
                    key: "AP_CHANNEL",
                    value: channel.to_string(),
                });
            }
            config.ap.channel = channel;
        }
        if let Some(max) = parse_key(&lookup, "AP_MAX_CONNECTIONS")? {
            config.ap.max_connections = max;
        }
        if let Some(addr) = parse_key(&lookup, "BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(workers) = parse_key::<usize, _>(&lookup, "HTTP_WORKERS")? {
            if workers == 0 {
                return Err(ConfigError::Invalid {
                    key: "HTTP_WORKERS",
                    value: workers.to_string(),
                });
            }
            config.http_workers = workers;
        }
        if let Some(url) = lookup("BACKEND_URL") {
            config.backend_url = url.trim_end_matches('/').to_string();
        }
        if let Some(uri) = lookup("BROKER_URI") {
            config.broker_uri = uri;
        }
        if let Some(target) = lookup("PROBE_TARGET") {
            config.probe_target = target;
        }
        if let Some(dir) = lookup("CERT_DIR") {
            config.cert_dir = Some(PathBuf::from(dir));
        }
        config.csr_pem = lookup("CSR_PEM").filter(|s| !s.is_empty());
        config.key_pem = lookup("KEY_PEM").filter(|s| !s.is_empty());
        if let Some(flag) = lookup("ERASE_ON_BOOT") {
            config.erase_on_boot = parse_bool("ERASE_ON_BOOT", &flag)?;
        }
        if let Some(list) = lookup("HOST_NETWORKS") {
            config.host_networks = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }

    /// Read settings from `PROVISIONER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Read settings captured at compile time.
    ///
    /// Used on the device, where there is no process environment:
    ///
    /// ```text
    /// PROVISIONER_BACKEND_URL="https://api.example.com" cargo build --features esp32
    /// ```
    pub fn from_build_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| build_env(key).map(str::to_string))
    }
}

fn build_env(key: &str) -> Option<&'static str> {
    match key {
        "AP_SSID" => option_env!("PROVISIONER_AP_SSID"),
        "AP_PASSWORD" => option_env!("PROVISIONER_AP_PASSWORD"),
        "AP_CHANNEL" => option_env!("PROVISIONER_AP_CHANNEL"),
        "AP_MAX_CONNECTIONS" => option_env!("PROVISIONER_AP_MAX_CONNECTIONS"),
        "BIND_ADDR" => option_env!("PROVISIONER_BIND_ADDR"),
        "HTTP_WORKERS" => option_env!("PROVISIONER_HTTP_WORKERS"),
        "BACKEND_URL" => option_env!("PROVISIONER_BACKEND_URL"),
        "BROKER_URI" => option_env!("PROVISIONER_BROKER_URI"),
        "PROBE_TARGET" => option_env!("PROVISIONER_PROBE_TARGET"),
        "CERT_DIR" => option_env!("PROVISIONER_CERT_DIR"),
        "CSR_PEM" => option_env!("PROVISIONER_CSR_PEM"),
        "KEY_PEM" => option_env!("PROVISIONER_KEY_PEM"),
        "ERASE_ON_BOOT" => option_env!("PROVISIONER_ERASE_ON_BOOT"),
        "HOST_NETWORKS" => option_env!("PROVISIONER_HOST_NETWORKS"),
        _ => None,
    }
}

fn parse_key<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

/// Errors from reading provisioner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting could not be parsed or is out of range.
    Invalid { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { key, value } => {
                write!(f, "invalid value for {}{}: {:?}", ENV_PREFIX, key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
