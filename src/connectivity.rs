//! Connectivity status shared between the supervisor and its readers.
//!
//! Only the supervisor's event processing writes the cell. HTTP handlers and
//! the orchestrator read it; a value one event behind is acceptable.

use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

/// Coarse link mode as reported by `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Disconnected,
    Provisioning,
    Connected,
}

/// Snapshot of the device's network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityStatus {
    pub mode: LinkMode,
    /// Station address, set only while `Connected`.
    pub ip: Option<Ipv4Addr>,
}

impl ConnectivityStatus {
    pub const DISCONNECTED: Self = Self {
        mode: LinkMode::Disconnected,
        ip: None,
    };

    pub const PROVISIONING: Self = Self {
        mode: LinkMode::Provisioning,
        ip: None,
    };

    pub fn connected(ip: Ipv4Addr) -> Self {
        Self {
            mode: LinkMode::Connected,
            ip: Some(ip),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.mode == LinkMode::Connected
    }
}

impl Default for ConnectivityStatus {
    fn default() -> Self {
        Self::DISCONNECTED
    }
}

/// Shared, cheaply cloneable handle to the current [`ConnectivityStatus`].
#[derive(Debug, Clone, Default)]
pub struct ConnectivityCell {
    inner: Arc<RwLock<ConnectivityStatus>>,
}

impl ConnectivityCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectivityStatus {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, status: ConnectivityStatus) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        let cell = ConnectivityCell::new();
        assert_eq!(cell.get(), ConnectivityStatus::DISCONNECTED);
        assert!(!cell.get().is_connected());
    }

    #[test]
    fn test_clones_share_state() {
        let cell = ConnectivityCell::new();
        let reader = cell.clone();
        cell.set(ConnectivityStatus::connected(Ipv4Addr::new(10, 0, 0, 7)));

        let status = reader.get();
        assert!(status.is_connected());
        assert_eq!(status.ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn test_mode_json() {
        assert_eq!(
            serde_json::to_value(LinkMode::Provisioning).unwrap(),
            serde_json::json!("provisioning")
        );
    }
}
