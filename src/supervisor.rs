//! Network mode supervisor.
//!
//! Owns the radio mode (access point for provisioning, station afterwards),
//! the provisioning server's lifetime, and the connectivity status. Link
//! notifications from the radio and hand-offs from the HTTP handlers arrive
//! on one inbound channel, drained by the orchestrator thread through
//! [`NetworkSupervisor::process_events`], so every state change happens on
//! that single thread.
//!
//! ```text
//! Idle --start_provisioning--> ApActive --CredentialsSubmitted--> StationConnecting
//!                                 ^                                   |
//!                                 |                            link up / GotIp
//!                        clear-and-restart                            v
//!                     (credential rejected) <-- StationDisconnected <- StationConnected
//! ```

use crate::config::{ProvisionerConfig, WifiCredentials};
use crate::connectivity::{ConnectivityCell, ConnectivityStatus};
use crate::radio::{classify_disconnect, DisconnectKind, LinkEvent, Radio, RadioError};
use crate::scan_cache::NetworkScanCache;
use crate::server::{ProvisioningServer, ProvisioningService};
use crate::store::{self, SharedStore};
use log::{debug, error, info, warn};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Wait between tearing the radio down and bringing the access point back.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Inbound supervisor events.
#[derive(Debug)]
pub enum SupervisorEvent {
    Link(LinkEvent),
    /// Credentials accepted by `/provision`; the response has been sent.
    CredentialsSubmitted(WifiCredentials),
}

pub type EventSender = Sender<SupervisorEvent>;

/// Create the supervisor's inbound channel.
pub fn event_channel() -> (EventSender, Receiver<SupervisorEvent>) {
    mpsc::channel()
}

/// Radio-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    ApActive,
    StationConnecting,
    StationConnected,
    StationDisconnected,
}

impl SupervisorState {
    /// A station connection exists or is being attempted.
    pub fn is_station(&self) -> bool {
        matches!(
            self,
            Self::StationConnecting | Self::StationConnected | Self::StationDisconnected
        )
    }
}

/// Supervisor errors.
#[derive(Debug)]
pub enum SupervisorError {
    Radio(RadioError),
    /// The provisioning server could not bind or spawn.
    Server(std::io::Error),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radio(e) => write!(f, "radio error: {}", e),
            Self::Server(e) => write!(f, "provisioning server error: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Radio(e) => Some(e),
            Self::Server(e) => Some(e),
        }
    }
}

impl From<RadioError> for SupervisorError {
    fn from(e: RadioError) -> Self {
        Self::Radio(e)
    }
}

/// Settings the supervisor needs from [`ProvisionerConfig`].
#[derive(Debug, Clone)]
struct Settings {
    ap: crate::config::ApSettings,
    bind_addr: SocketAddr,
    http_workers: usize,
    scan_refresh_timeout: Duration,
    ap_ip: Ipv4Addr,
    restart_delay: Duration,
}

/// Radio mode and provisioning listener owner.
pub struct NetworkSupervisor {
    radio: Arc<dyn Radio>,
    store: SharedStore,
    cache: Arc<NetworkScanCache>,
    connectivity: ConnectivityCell,
    server: Option<ProvisioningServer>,
    events_tx: EventSender,
    events_rx: Receiver<SupervisorEvent>,
    state: SupervisorState,
    settings: Settings,
}

impl NetworkSupervisor {
    /// `events` must be the channel whose sender was handed to the radio.
    pub fn new(
        radio: Arc<dyn Radio>,
        store: SharedStore,
        cache: Arc<NetworkScanCache>,
        config: &ProvisionerConfig,
        events: (EventSender, Receiver<SupervisorEvent>),
    ) -> Self {
        let (events_tx, events_rx) = events;
        Self {
            radio,
            store,
            cache,
            connectivity: ConnectivityCell::new(),
            server: None,
            events_tx,
            events_rx,
            state: SupervisorState::Idle,
            settings: Settings {
                ap: config.ap.clone(),
                bind_addr: config.bind_addr,
                http_workers: config.http_workers,
                scan_refresh_timeout: config.scan_refresh_timeout,
                ap_ip: Ipv4Addr::from(crate::config::DEFAULT_AP_IP),
                restart_delay: config.timings.restart_delay,
            },
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Reader handle for the connectivity status.
    pub fn connectivity(&self) -> ConnectivityCell {
        self.connectivity.clone()
    }

    /// Sender for injecting events (radio callbacks, tests).
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Whether the provisioning listener is accepting requests.
    pub fn is_provisioning_active(&self) -> bool {
        self.server.as_ref().map_or(false, |s| s.is_active())
    }

    /// Address of the running provisioning server.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(|s| s.local_addr())
    }

    /// Ensure the provisioning listener is active.
    ///
    /// A no-op when it already is. Otherwise brings the access point up,
    /// populates the scan cache, and starts the HTTP server. A failed initial
    /// scan is logged and retried by the first scan request.
    pub fn start_provisioning(&mut self) -> Result<(), SupervisorError> {
        if self.is_provisioning_active() {
            return Ok(());
        }
        // Listener stopped by a submit but not yet torn down
        self.stop_provisioning();

        info!("Starting provisioning access point '{}'", self.settings.ap.ssid);
        self.radio.start_access_point(&self.settings.ap)?;

        if let Err(e) = self.cache.refresh() {
            warn!("Initial network scan failed: {}", e);
        }

        let service = Arc::new(ProvisioningService::new(
            self.store.clone(),
            self.cache.clone(),
            self.connectivity.clone(),
            self.events_tx.clone(),
            self.settings.ap_ip,
            self.settings.scan_refresh_timeout,
        ));

        match ProvisioningServer::start(
            self.settings.bind_addr,
            self.settings.http_workers,
            service,
        ) {
            Ok(server) => {
                self.server = Some(server);
                self.state = SupervisorState::ApActive;
                self.connectivity.set(ConnectivityStatus::PROVISIONING);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start provisioning server: {}", e);
                if let Err(e) = self.radio.stop() {
                    warn!("Failed to stop radio: {}", e);
                }
                self.cache.invalidate();
                self.state = SupervisorState::Idle;
                self.connectivity.set(ConnectivityStatus::DISCONNECTED);
                Err(SupervisorError::Server(e))
            }
        }
    }

    /// Tear down the provisioning server, if any.
    pub fn stop_provisioning(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
            self.cache.invalidate();
        }
    }

    /// Switch to station mode and start associating.
    pub fn connect_station(&mut self, creds: &WifiCredentials) -> Result<(), SupervisorError> {
        self.stop_provisioning();
        match self.radio.connect_station(creds) {
            Ok(()) => {
                self.state = SupervisorState::StationConnecting;
                self.connectivity.set(ConnectivityStatus::PROVISIONING);
                Ok(())
            }
            Err(e) => {
                error!("Station connect to '{}' failed: {}", creds.ssid(), e);
                self.state = SupervisorState::Idle;
                self.connectivity.set(ConnectivityStatus::DISCONNECTED);
                Err(e.into())
            }
        }
    }

    /// Start a station connection unless one exists or is in progress.
    pub fn ensure_station(&mut self, creds: &WifiCredentials) -> Result<(), SupervisorError> {
        if self.state.is_station() {
            return Ok(());
        }
        self.connect_station(creds)
    }

    /// Handle every queued event. Returns the number handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::CredentialsSubmitted(creds) => {
                info!("Credentials submitted, switching to station mode");
                // The flag is already set; the orchestrator retries on failure
                let _ = self.connect_station(&creds);
            }
            SupervisorEvent::Link(link) => self.handle_link(link),
        }
    }

    fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StationStarted => debug!("Station interface started"),
            LinkEvent::StationConnected => {
                if self.state.is_station() {
                    info!("Associated with access point, waiting for address");
                    self.state = SupervisorState::StationConnected;
                }
            }
            LinkEvent::GotIp(ip) => {
                if self.state.is_station() {
                    info!("Got IP: {}", ip);
                    self.state = SupervisorState::StationConnected;
                    self.connectivity.set(ConnectivityStatus::connected(ip));
                } else {
                    debug!("Ignoring station address {} outside station mode", ip);
                }
            }
            LinkEvent::StationDisconnected { reason } => {
                if !self.state.is_station() {
                    // Scans in AP+STA mode report disconnects too
                    debug!("Station disconnect (reason {}) outside station mode", reason);
                    return;
                }
                match classify_disconnect(reason) {
                    DisconnectKind::CredentialRejected => {
                        error!(
                            "WiFi authentication failed (reason {}), clearing credentials",
                            reason
                        );
                        self.clear_and_restart();
                    }
                    DisconnectKind::Transient => {
                        warn!("WiFi disconnected (reason {}), reconnecting", reason);
                        self.state = SupervisorState::StationDisconnected;
                        self.connectivity.set(ConnectivityStatus::PROVISIONING);
                        if let Err(e) = self.radio.reassociate() {
                            warn!("Reconnect request failed: {}", e);
                        }
                    }
                }
            }
            LinkEvent::ApClientJoined { mac } => info!("Station {} joined AP", format_mac(&mac)),
            LinkEvent::ApClientLeft { mac } => info!("Station {} left AP", format_mac(&mac)),
            LinkEvent::ApAssignedIp(ip) => info!("AP assigned {} to a client", ip),
        }
    }

    /// Discard stored credentials and return to provisioning.
    pub fn clear_and_restart(&mut self) {
        if let Err(e) = store::lock(&self.store).clear_record() {
            error!("Failed to clear credentials: {}", e);
        }
        self.stop_provisioning();
        self.connectivity.set(ConnectivityStatus::DISCONNECTED);
        if let Err(e) = self.radio.stop() {
            warn!("Failed to stop radio: {}", e);
        }
        self.state = SupervisorState::Idle;

        thread::sleep(self.settings.restart_delay);

        info!("Restarting provisioning mode");
        if let Err(e) = self.start_provisioning() {
            error!("Failed to restart provisioning: {}", e);
        }
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
