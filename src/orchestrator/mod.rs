//! Device lifecycle control loop.
//!
//! A single thread walks the device from boot to an established messaging
//! session. Each [`Orchestrator::step`] runs one state's action, including
//! its wait, and picks the next state. Supervisor events are drained at the
//! start of every step and throughout every wait, so link changes are seen
//! within one poll interval.

mod state;

pub use state::{
    LifecycleState, OrchestratorState, RetryCounters, Timings, HEARTBEAT_INTERVAL,
    MAX_MESSAGING_ATTEMPTS, MAX_PROBE_ATTEMPTS,
};

use crate::collaborators::{
    ConnectivityProbe, DeviceCertificates, IdentityIssuer, MessagingClient,
};
use crate::radio::RadioError;
use crate::store::{self, SharedStore, StoreError};
use crate::supervisor::{NetworkSupervisor, SupervisorError};
use log::{debug, error, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Slice used while sleeping so events keep flowing.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Lifecycle driver.
pub struct Orchestrator {
    supervisor: NetworkSupervisor,
    store: SharedStore,
    issuer: Box<dyn IdentityIssuer>,
    messaging: Box<dyn MessagingClient>,
    probe: Box<dyn ConnectivityProbe>,
    timings: Timings,
    state: OrchestratorState,
    certificates: Option<DeviceCertificates>,
}

impl Orchestrator {
    pub fn new(
        supervisor: NetworkSupervisor,
        store: SharedStore,
        issuer: Box<dyn IdentityIssuer>,
        messaging: Box<dyn MessagingClient>,
        probe: Box<dyn ConnectivityProbe>,
        timings: Timings,
    ) -> Self {
        Self {
            supervisor,
            store,
            issuer,
            messaging,
            probe,
            timings,
            state: OrchestratorState::default(),
            certificates: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.current()
    }

    pub fn counters(&self) -> &RetryCounters {
        &self.state.counters
    }

    pub fn supervisor(&self) -> &NetworkSupervisor {
        &self.supervisor
    }

    /// Run the lifecycle forever.
    pub fn run(&mut self) -> ! {
        info!("Orchestrator started");
        loop {
            self.step();
            self.pause(self.timings.loop_tick);
        }
    }

    /// Execute one state's action. Returns the state afterwards.
    pub fn step(&mut self) -> LifecycleState {
        self.supervisor.process_events();

        let next = match self.state.current() {
            LifecycleState::Init => LifecycleState::CheckProvisioned,
            LifecycleState::CheckProvisioned => {
                if self.is_provisioned() {
                    info!("Device is provisioned, connecting to WiFi");
                    LifecycleState::ConnectingWifi
                } else {
                    info!("Device not provisioned, starting AP mode");
                    LifecycleState::ApMode
                }
            }
            LifecycleState::ApMode => self.ap_mode(),
            LifecycleState::ConnectingWifi => self.connecting_wifi(),
            LifecycleState::WifiConnected => self.wifi_connected(),
            LifecycleState::CheckCertificates => self.check_certificates(),
            LifecycleState::SubmittingCsr => self.submitting_csr(),
            LifecycleState::ConnectingMessaging => self.connecting_messaging(),
            LifecycleState::Operational => self.operational(),
            LifecycleState::Error => {
                error!("Application in error state");
                self.pause(self.timings.error_wait);
                LifecycleState::Error
            }
        };

        self.state.enter(next);
        next
    }

    fn is_provisioned(&self) -> bool {
        store::lock(&self.store).is_provisioned().unwrap_or_else(|e| {
            warn!("Failed to read provisioning flag: {}", e);
            false
        })
    }

    /// The record was cleared while past AP mode, e.g. after an
    /// authentication failure. Every such state falls back to AP mode.
    fn credentials_cleared(&self) -> bool {
        if self.is_provisioned() {
            return false;
        }
        info!("Credentials were cleared, returning to AP mode");
        true
    }

    /// Sleep for `duration` while draining supervisor events.
    fn pause(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            self.supervisor.process_events();
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    fn ap_mode(&mut self) -> LifecycleState {
        // Checked before touching the listener: a submit stops it, and
        // restarting it here would bring the access point back up.
        if self.is_provisioned() {
            info!("Credentials received, moving to WiFi connecting state");
            return LifecycleState::ConnectingWifi;
        }

        match self.supervisor.start_provisioning() {
            Ok(()) => {
                debug!("Provisioning AP active, waiting for credentials");
                self.pause(self.timings.ap_poll);
            }
            Err(e) => {
                error!("Failed to start provisioning: {}, retrying", e);
                self.pause(self.timings.ap_retry);
            }
        }
        LifecycleState::ApMode
    }

    fn connecting_wifi(&mut self) -> LifecycleState {
        if self.credentials_cleared() {
            return LifecycleState::ApMode;
        }
        if self.supervisor.connectivity().get().is_connected() {
            return LifecycleState::WifiConnected;
        }

        if !self.state.counters.station_requested {
            let record = store::lock(&self.store).load_record();
            match record {
                Ok(Some(record)) => {
                    let creds = record.wifi();
                    info!("Connecting to WiFi '{}'", creds.ssid());
                    match self.supervisor.ensure_station(&creds) {
                        Ok(()) => self.state.counters.station_requested = true,
                        Err(SupervisorError::Radio(RadioError::InvalidConfig(what))) => {
                            error!("Radio rejected stored credentials ({}), clearing", what);
                            self.supervisor.clear_and_restart();
                            return LifecycleState::ApMode;
                        }
                        Err(e) => warn!("Station connect failed: {}", e),
                    }
                }
                Ok(None) => return LifecycleState::ApMode,
                Err(StoreError::Incomplete { key }) => {
                    error!("Stored credentials incomplete (missing {}), clearing", key);
                    self.supervisor.clear_and_restart();
                    return LifecycleState::ApMode;
                }
                Err(e) => warn!("Failed to load credentials: {}", e),
            }
        }

        self.pause(self.timings.wifi_poll);
        LifecycleState::ConnectingWifi
    }

    fn wifi_connected(&mut self) -> LifecycleState {
        if self.credentials_cleared() {
            return LifecycleState::ApMode;
        }

        info!("WiFi connected, verifying internet access");
        self.pause(self.timings.probe_settle);

        if self.probe.check() {
            info!("Internet connectivity verified");
            return LifecycleState::CheckCertificates;
        }

        let counters = &mut self.state.counters;
        counters.probe_attempts += 1;
        error!(
            "Internet verification failed (attempt {}/{})",
            counters.probe_attempts, MAX_PROBE_ATTEMPTS
        );
        if counters.probe_attempts >= MAX_PROBE_ATTEMPTS {
            error!("WiFi has no internet access, clearing credentials and returning to AP mode");
            self.supervisor.clear_and_restart();
            return LifecycleState::ApMode;
        }

        self.pause(self.timings.probe_retry);
        LifecycleState::WifiConnected
    }

    fn check_certificates(&mut self) -> LifecycleState {
        if self.credentials_cleared() {
            return LifecycleState::ApMode;
        }
        let stored = store::lock(&self.store).load_certificates();
        match stored {
            Ok(Some(certs)) => {
                info!("Certificates found, proceeding to messaging connection");
                self.certificates = Some(certs);
                LifecycleState::ConnectingMessaging
            }
            Ok(None) => {
                info!("Certificates not found, submitting signing request");
                LifecycleState::SubmittingCsr
            }
            Err(e) => {
                warn!("Failed to read certificates ({}), requesting new ones", e);
                LifecycleState::SubmittingCsr
            }
        }
    }

    fn submitting_csr(&mut self) -> LifecycleState {
        if self.credentials_cleared() {
            return LifecycleState::ApMode;
        }
        let loaded = store::lock(&self.store).load_record();
        let record = match loaded {
            Ok(Some(record)) => record,
            Ok(None) => return LifecycleState::ApMode,
            Err(StoreError::Incomplete { key }) => {
                error!("Stored credentials incomplete (missing {}), clearing", key);
                self.supervisor.clear_and_restart();
                return LifecycleState::ApMode;
            }
            Err(e) => {
                warn!("Failed to get provisioning credentials ({}), retrying", e);
                self.pause(self.timings.csr_backoff);
                return LifecycleState::SubmittingCsr;
            }
        };

        match self
            .issuer
            .submit_request(&record.device_id, &record.provisioning_token)
        {
            Ok(certs) => {
                info!("Signing request accepted, certificates issued");
                if let Err(e) = store::lock(&self.store).save_certificates(&certs) {
                    warn!("Failed to persist certificates: {}", e);
                }
                self.certificates = Some(certs);
                LifecycleState::ConnectingMessaging
            }
            Err(e) => {
                error!("Failed to submit signing request: {}", e);
                self.pause(self.timings.csr_backoff);
                LifecycleState::SubmittingCsr
            }
        }
    }

    fn connecting_messaging(&mut self) -> LifecycleState {
        if self.credentials_cleared() {
            return LifecycleState::ApMode;
        }
        let certs = match self.certificates.clone() {
            Some(certs) => certs,
            None => match store::lock(&self.store).load_certificates() {
                Ok(Some(certs)) => certs,
                _ => return LifecycleState::CheckCertificates,
            },
        };

        let connected = match self.messaging.start(&certs) {
            Ok(()) => {
                info!("Messaging client started, waiting for connection");
                self.await_messaging()
            }
            Err(e) => {
                error!("Failed to start messaging client: {}", e);
                false
            }
        };

        if connected {
            info!("Device provisioning complete, messaging session established");
            return LifecycleState::Operational;
        }

        self.messaging.stop();
        // Lost the network itself, not just the broker
        if self.credentials_cleared() {
            return LifecycleState::ApMode;
        }
        let counters = &mut self.state.counters;
        counters.messaging_attempts += 1;
        if counters.messaging_attempts >= MAX_MESSAGING_ATTEMPTS {
            error!(
                "Messaging connection failed after {} attempts",
                MAX_MESSAGING_ATTEMPTS
            );
            return LifecycleState::Error;
        }
        warn!(
            "Retrying messaging connection ({}/{})",
            counters.messaging_attempts, MAX_MESSAGING_ATTEMPTS
        );
        self.pause(self.timings.messaging_backoff);
        LifecycleState::ConnectingMessaging
    }

    fn await_messaging(&mut self) -> bool {
        let started = Instant::now();
        loop {
            if self.messaging.is_connected() {
                return true;
            }
            if started.elapsed() >= self.timings.messaging_timeout {
                warn!("Messaging connection timeout");
                return false;
            }
            if !self.is_provisioned() {
                return false;
            }
            self.pause(self.timings.messaging_poll);
        }
    }

    fn operational(&mut self) -> LifecycleState {
        if self.credentials_cleared() {
            self.messaging.stop();
            return LifecycleState::ApMode;
        }
        if !self.messaging.is_connected() {
            warn!("Messaging connection lost, reconnecting");
            self.messaging.stop();
            return LifecycleState::ConnectingMessaging;
        }

        let counters = &mut self.state.counters;
        counters.operational_checks += 1;
        if counters.operational_checks >= HEARTBEAT_INTERVAL {
            info!("Messaging connection healthy, device operational");
            counters.operational_checks = 0;
        }

        self.pause(self.timings.operational_poll);
        LifecycleState::Operational
    }
}
