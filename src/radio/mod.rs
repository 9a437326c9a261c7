//! Radio abstraction.
//!
//! The supervisor drives mode changes through [`Radio`]; link-layer
//! notifications come back asynchronously as [`LinkEvent`]s pushed onto the
//! supervisor's event channel from the driver's callback context.
//!
//! - **ESP32** (`esp32` feature): [`EspRadio`] over `EspWifi`
//! - **Host**: [`HostRadio`], a simulated radio on the OS network

#[cfg(feature = "esp32")]
mod esp;
mod host;

#[cfg(feature = "esp32")]
pub use esp::EspRadio;
pub use host::{HostMode, HostRadio};

use crate::config::{ApSettings, WifiCredentials};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Authentication failure (802.11 4-way handshake timeout).
pub const REASON_4WAY_HANDSHAKE_TIMEOUT: u16 = 15;

/// Driver-specific reasons that all mean the credentials or network are wrong
/// (beacon timeout, no AP found, auth fail, assoc fail, handshake timeout, ...).
pub const REASON_CREDENTIAL_RANGE: std::ops::RangeInclusive<u16> = 201..=209;

/// One visible network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkScanEntry {
    pub ssid: String,
    pub rssi: i8,
    pub channel: u8,
    pub secure: bool,
}

/// Link-layer notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StationStarted,
    StationConnected,
    StationDisconnected { reason: u16 },
    /// Station address assigned by DHCP.
    GotIp(Ipv4Addr),
    ApClientJoined { mac: [u8; 6] },
    ApClientLeft { mac: [u8; 6] },
    /// The access point leased an address to a client.
    ApAssignedIp(Ipv4Addr),
}

/// How a station disconnect should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The stored credentials are wrong; they must be discarded.
    CredentialRejected,
    /// Signal loss or AP restart; retry with the same credentials.
    Transient,
}

/// Classify a disconnect reason code.
pub fn classify_disconnect(reason: u16) -> DisconnectKind {
    if reason == REASON_4WAY_HANDSHAKE_TIMEOUT || REASON_CREDENTIAL_RANGE.contains(&reason) {
        DisconnectKind::CredentialRejected
    } else {
        DisconnectKind::Transient
    }
}

/// Blocking network scan.
pub trait Scanner: Send + Sync {
    fn scan(&self) -> Result<Vec<NetworkScanEntry>, RadioError>;
}

/// Radio mode control.
///
/// All calls return once the driver accepted the request; outcomes arrive as
/// [`LinkEvent`]s.
pub trait Radio: Scanner {
    /// Bring up the access point with the station interface enabled for scans.
    fn start_access_point(&self, ap: &ApSettings) -> Result<(), RadioError>;
    /// Switch to station-only mode and begin associating.
    fn connect_station(&self, creds: &WifiCredentials) -> Result<(), RadioError>;
    /// Retry association with the current station configuration.
    fn reassociate(&self) -> Result<(), RadioError>;
    /// Turn the radio off.
    fn stop(&self) -> Result<(), RadioError>;
}

/// Radio errors.
#[derive(Debug)]
pub enum RadioError {
    /// SSID or password rejected by the driver.
    InvalidConfig(&'static str),
    /// The radio is not in a mode that allows the operation.
    NotStarted,
    /// ESP-IDF driver error.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(what) => write!(f, "invalid radio configuration: {}", what),
            Self::NotStarted => write!(f, "radio not started"),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "WiFi driver error: {:?}", e),
        }
    }
}

impl std::error::Error for RadioError {}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for RadioError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}
