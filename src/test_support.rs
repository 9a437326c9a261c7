//! Shared fakes for unit tests.

use crate::collaborators::{
    CollaboratorError, ConnectivityProbe, DeviceCertificates, IdentityIssuer, MessagingClient,
};
use crate::config::{ApSettings, DeviceCredentialRecord, ProvisionerConfig, WifiCredentials};
use crate::orchestrator::Timings;
use crate::radio::{NetworkScanEntry, Radio, RadioError, Scanner};
use crate::scan_cache::NetworkScanCache;
use crate::store::{self, MemoryStore, SharedStore};
use crate::supervisor::{event_channel, EventSender, NetworkSupervisor, SupervisorEvent};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub fn network(ssid: &str) -> NetworkScanEntry {
    NetworkScanEntry {
        ssid: ssid.to_string(),
        rssi: -60,
        channel: 6,
        secure: true,
    }
}

pub fn valid_record() -> DeviceCredentialRecord {
    DeviceCredentialRecord {
        ssid: "HomeNet".to_string(),
        password: "secret123".to_string(),
        device_id: "device-1".to_string(),
        provisioning_token: "token-1".to_string(),
        bearer_token: None,
        provisioned: true,
    }
}

pub fn certificates() -> DeviceCertificates {
    DeviceCertificates {
        certificate_pem: "-----BEGIN CERTIFICATE-----\ndevice\n-----END CERTIFICATE-----\n"
            .to_string(),
        ca_certificate_pem: "-----BEGIN CERTIFICATE-----\nca\n-----END CERTIFICATE-----\n"
            .to_string(),
    }
}

// ==================== Radio Fakes ====================

/// Scanner returning a fixed network list.
pub struct FakeScanner {
    networks: Vec<NetworkScanEntry>,
    fail: AtomicBool,
    scans: AtomicUsize,
    blocked: Mutex<bool>,
    unblocked: Condvar,
}

impl FakeScanner {
    pub fn new(networks: Vec<NetworkScanEntry>) -> Self {
        Self {
            networks,
            fail: AtomicBool::new(false),
            scans: AtomicUsize::new(0),
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Scans started so far, including ones still blocked.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Hold every scan until unblocked, like a hung radio.
    pub fn set_blocked(&self, blocked: bool) {
        *self.blocked.lock().unwrap() = blocked;
        self.unblocked.notify_all();
    }
}

impl Scanner for FakeScanner {
    fn scan(&self) -> Result<Vec<NetworkScanEntry>, RadioError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let mut blocked = self.blocked.lock().unwrap();
        while *blocked {
            blocked = self.unblocked.wait(blocked).unwrap();
        }
        drop(blocked);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RadioError::NotStarted);
        }
        Ok(self.networks.clone())
    }
}

/// Mode changes issued to a [`FakeRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartAp,
    ConnectStation(String),
    Reassociate,
    Stop,
}

/// Radio recording mode changes. Scans are not recorded.
pub struct FakeRadio {
    scanner: FakeScanner,
    calls: Mutex<Vec<RadioCall>>,
    fail_ap: AtomicBool,
    fail_station: AtomicBool,
}

impl FakeRadio {
    pub fn new(networks: Vec<NetworkScanEntry>) -> Self {
        Self {
            scanner: FakeScanner::new(networks),
            calls: Mutex::new(Vec::new()),
            fail_ap: AtomicBool::new(false),
            fail_station: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_scan_fail(&self, fail: bool) {
        self.scanner.set_fail(fail);
    }

    pub fn set_fail_ap(&self, fail: bool) {
        self.fail_ap.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_station(&self, fail: bool) {
        self.fail_station.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Scanner for FakeRadio {
    fn scan(&self) -> Result<Vec<NetworkScanEntry>, RadioError> {
        self.scanner.scan()
    }
}

impl Radio for FakeRadio {
    fn start_access_point(&self, _ap: &ApSettings) -> Result<(), RadioError> {
        if self.fail_ap.load(Ordering::SeqCst) {
            return Err(RadioError::InvalidConfig("simulated AP failure"));
        }
        self.record(RadioCall::StartAp);
        Ok(())
    }

    fn connect_station(&self, creds: &WifiCredentials) -> Result<(), RadioError> {
        if self.fail_station.load(Ordering::SeqCst) {
            return Err(RadioError::InvalidConfig("simulated station failure"));
        }
        if creds.validate().is_err() {
            return Err(RadioError::InvalidConfig("station credentials"));
        }
        self.record(RadioCall::ConnectStation(creds.ssid().to_string()));
        Ok(())
    }

    fn reassociate(&self) -> Result<(), RadioError> {
        self.record(RadioCall::Reassociate);
        Ok(())
    }

    fn stop(&self) -> Result<(), RadioError> {
        self.record(RadioCall::Stop);
        Ok(())
    }
}

// ==================== Supervisor Fixture ====================

/// Supervisor over a [`FakeRadio`] and a [`MemoryStore`], serving on an
/// ephemeral loopback port with every wait zeroed.
pub struct SupervisorFixture {
    pub supervisor: NetworkSupervisor,
    pub radio: Arc<FakeRadio>,
    pub cache: Arc<NetworkScanCache>,
    pub store: SharedStore,
    pub events: EventSender,
}

impl SupervisorFixture {
    pub fn new() -> Self {
        Self::with_bind(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    pub fn with_bind(bind_addr: SocketAddr) -> Self {
        let radio = Arc::new(FakeRadio::new(vec![network("HomeNet"), network("Cafe")]));
        let cache = Arc::new(NetworkScanCache::with_waits(
            radio.clone(),
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        let store = store::shared(MemoryStore::new());
        let config = ProvisionerConfig {
            bind_addr,
            http_workers: 1,
            timings: Timings::immediate(),
            ..ProvisionerConfig::default()
        };
        let (tx, rx) = event_channel();
        let events = tx.clone();
        let supervisor =
            NetworkSupervisor::new(radio.clone(), store.clone(), cache.clone(), &config, (tx, rx));
        Self {
            supervisor,
            radio,
            cache,
            store,
            events,
        }
    }

    pub fn send(&self, event: SupervisorEvent) {
        self.events.send(event).unwrap();
    }
}

// ==================== Collaborator Fakes ====================

/// Issuer answering with [`certificates`], optionally failing first.
#[derive(Clone, Default)]
pub struct FakeIssuer {
    requests: Arc<Mutex<Vec<(String, String)>>>,
    failures_left: Arc<AtomicUsize>,
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` requests with a 500.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// `(device_id, provisioning_token)` of every request so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

impl IdentityIssuer for FakeIssuer {
    fn submit_request(
        &mut self,
        device_id: &str,
        provisioning_token: &str,
    ) -> Result<DeviceCertificates, CollaboratorError> {
        self.requests
            .lock()
            .unwrap()
            .push((device_id.to_string(), provisioning_token.to_string()));
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CollaboratorError::Status(500));
        }
        Ok(certificates())
    }
}

/// Messaging client whose connection state the test controls.
#[derive(Clone, Default)]
pub struct FakeMessaging {
    connected: Arc<AtomicBool>,
    connect_on_start: Arc<AtomicBool>,
    fail_start: Arc<AtomicBool>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl FakeMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connect_on_start(&self, connect: bool) {
        self.connect_on_start.store(connect, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MessagingClient for FakeMessaging {
    fn start(&mut self, _certs: &DeviceCertificates) -> Result<(), CollaboratorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CollaboratorError::NotConfigured("broker"));
        }
        if self.connect_on_start.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Probe replaying queued results, failing once the queue is empty.
#[derive(Clone, Default)]
pub struct FakeProbe {
    results: Arc<Mutex<VecDeque<bool>>>,
    checks: Arc<AtomicUsize>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: bool) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl ConnectivityProbe for FakeProbe {
    fn check(&mut self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.results.lock().unwrap().pop_front().unwrap_or(false)
    }
}
