//! Simulated radio for host builds.
//!
//! The OS owns the real network, so "joining" a network succeeds immediately
//! with the host's default-route address. Joining an SSID that is not in the
//! simulated scan list fails the way a device does when the AP is absent.

use super::{LinkEvent, NetworkScanEntry, Radio, RadioError, Scanner};
use crate::config::{ApSettings, WifiCredentials};
use crate::supervisor::{EventSender, SupervisorEvent};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Mutex, PoisonError};

/// Reason code reported when the requested SSID is not visible.
const REASON_NO_AP_FOUND: u16 = 201;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    Off,
    AccessPoint,
    Station,
}

/// Host radio provider.
pub struct HostRadio {
    events: Mutex<EventSender>,
    networks: Vec<NetworkScanEntry>,
    mode: Mutex<HostMode>,
}

impl HostRadio {
    /// Create a radio that reports `networks` from every scan.
    pub fn new(events: EventSender, networks: Vec<NetworkScanEntry>) -> Self {
        Self {
            events: Mutex::new(events),
            networks,
            mode: Mutex::new(HostMode::Off),
        }
    }

    pub fn mode(&self) -> HostMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: HostMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn emit(&self, event: LinkEvent) {
        debug!("Host radio event: {:?}", event);
        let sender = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(SupervisorEvent::Link(event)).is_err() {
            warn!("Event channel closed, dropping link event");
        }
    }

    /// Get the primary local IP address.
    ///
    /// This uses a trick: create a UDP socket and "connect" to a public IP
    /// (doesn't actually send anything), then check which local address was chosen.
    fn detect_local_ip() -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }

    fn associate(&self, ssid: &str) {
        self.emit(LinkEvent::StationStarted);
        if !self.networks.iter().any(|n| n.ssid == ssid) {
            warn!("Host radio: network '{}' not visible", ssid);
            self.emit(LinkEvent::StationDisconnected {
                reason: REASON_NO_AP_FOUND,
            });
            return;
        }
        self.emit(LinkEvent::StationConnected);
        let ip = Self::detect_local_ip().unwrap_or(Ipv4Addr::LOCALHOST);
        self.emit(LinkEvent::GotIp(ip));
    }
}

impl Scanner for HostRadio {
    fn scan(&self) -> Result<Vec<NetworkScanEntry>, RadioError> {
        if self.mode() == HostMode::Off {
            return Err(RadioError::NotStarted);
        }
        Ok(self.networks.clone())
    }
}

impl Radio for HostRadio {
    fn start_access_point(&self, ap: &ApSettings) -> Result<(), RadioError> {
        info!(
            "Host radio: access point '{}' on channel {} ({})",
            ap.ssid,
            ap.channel,
            if ap.is_open() { "open" } else { "secured" }
        );
        self.set_mode(HostMode::AccessPoint);
        Ok(())
    }

    fn connect_station(&self, creds: &WifiCredentials) -> Result<(), RadioError> {
        // Same limits as the device driver
        if let Err(e) = creds.validate() {
            warn!("Host radio: rejecting station credentials: {}", e);
            return Err(RadioError::InvalidConfig("station credentials"));
        }
        info!("Host radio: joining '{}'", creds.ssid());
        self.set_mode(HostMode::Station);
        self.associate(creds.ssid());
        Ok(())
    }

    fn reassociate(&self) -> Result<(), RadioError> {
        if self.mode() != HostMode::Station {
            return Err(RadioError::NotStarted);
        }
        // Simulated links never drop on their own; report a fresh association.
        self.emit(LinkEvent::StationConnected);
        let ip = Self::detect_local_ip().unwrap_or(Ipv4Addr::LOCALHOST);
        self.emit(LinkEvent::GotIp(ip));
        Ok(())
    }

    fn stop(&self) -> Result<(), RadioError> {
        info!("Host radio stopped");
        self.set_mode(HostMode::Off);
        Ok(())
    }
}
