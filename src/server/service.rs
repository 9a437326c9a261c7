//! Endpoint semantics, independent of the HTTP transport.

use super::request::{self, RequestError};
use crate::connectivity::{ConnectivityCell, LinkMode};
use crate::scan_cache::{CacheError, NetworkScanCache};
use crate::store::{self, SharedStore};
use crate::supervisor::{EventSender, SupervisorEvent};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Outcome slot of a background scan, shared by every caller waiting on it.
type RefreshSlot = Arc<(Mutex<Option<Result<usize, CacheError>>>, Condvar)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of an endpoint call.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Event to queue once the response has been written.
    pub follow_up: Option<SupervisorEvent>,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            follow_up: None,
        }
    }

    fn error(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            follow_up: None,
        }
    }
}

impl From<RequestError> for ApiResponse {
    fn from(e: RequestError) -> Self {
        Self::error(e.status(), e.body())
    }
}

/// State shared by the provisioning handlers.
pub struct ProvisioningService {
    store: SharedStore,
    cache: Arc<NetworkScanCache>,
    connectivity: ConnectivityCell,
    events: Mutex<EventSender>,
    active: AtomicBool,
    /// Set by the first `/provision` that gets to save; never cleared on success.
    submitted: AtomicBool,
    /// Scan started by a forced refresh and not yet finished.
    in_flight: Arc<Mutex<Option<RefreshSlot>>>,
    ap_ip: Ipv4Addr,
    refresh_timeout: Duration,
}

impl ProvisioningService {
    pub fn new(
        store: SharedStore,
        cache: Arc<NetworkScanCache>,
        connectivity: ConnectivityCell,
        events: EventSender,
        ap_ip: Ipv4Addr,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            connectivity,
            events: Mutex::new(events),
            active: AtomicBool::new(false),
            submitted: AtomicBool::new(false),
            in_flight: Arc::new(Mutex::new(None)),
            ap_ip,
            refresh_timeout,
        }
    }

    /// Whether the listener accepts requests.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Whether a submit has claimed the session. Later requests are refused.
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Refresh the cache, giving up after the server I/O timeout.
    ///
    /// Only one scan runs at a time: a call made while one is in flight waits
    /// for that scan instead of starting another. A scan that outlives the
    /// timeout keeps running in the background and still updates the cache
    /// when it finishes.
    fn refresh_bounded(&self) -> Result<usize, CacheError> {
        let slot = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.as_ref() {
                Some(slot) => {
                    debug!("Waiting on the scan already in flight");
                    slot.clone()
                }
                None => {
                    let slot: RefreshSlot = Arc::new((Mutex::new(None), Condvar::new()));
                    self.spawn_refresh(slot.clone())?;
                    *in_flight = Some(slot.clone());
                    slot
                }
            }
        };

        let (result, ready) = &*slot;
        let (result, _) = ready
            .wait_timeout_while(lock(result), self.refresh_timeout, |r| r.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match *result {
            Some(outcome) => outcome,
            None => {
                warn!("Scan refresh exceeded {:?}", self.refresh_timeout);
                Err(CacheError::ScanFailed)
            }
        }
    }

    fn spawn_refresh(&self, slot: RefreshSlot) -> Result<(), CacheError> {
        let cache = self.cache.clone();
        let in_flight = self.in_flight.clone();
        thread::Builder::new()
            .name("scan-refresh".to_string())
            .spawn(move || {
                let outcome = cache.refresh();
                lock(&in_flight).take();
                let (result, ready) = &*slot;
                *lock(result) = Some(outcome);
                ready.notify_all();
            })
            .map(|_| ())
            .map_err(|e| {
                error!("Failed to spawn scan thread: {}", e);
                CacheError::ScanFailed
            })
    }

    /// `GET /local-wifi`
    pub fn scan(&self, refresh: bool) -> ApiResponse {
        let mut refreshed = false;
        if refresh {
            refreshed = self.refresh_bounded().is_ok();
        }

        let mut snapshot = match self.cache.read() {
            Ok(snapshot) => snapshot,
            Err(_) => return ApiResponse::error(500, json!({"error": "cache_busy"})),
        };

        // First request after a failed initial scan
        if !snapshot.populated && !refresh {
            refreshed = self.refresh_bounded().is_ok();
            snapshot = match self.cache.read() {
                Ok(snapshot) => snapshot,
                Err(_) => return ApiResponse::error(500, json!({"error": "cache_busy"})),
            };
        }

        if !snapshot.populated {
            return ApiResponse::error(
                500,
                json!({"error": "scan_failed", "message": "No cached data available"}),
            );
        }

        ApiResponse::ok(json!({
            "networks": snapshot.entries,
            "count": snapshot.entries.len(),
            "cached": !refreshed,
        }))
    }

    /// `POST /provision`
    ///
    /// `body` is the already size-checked request body.
    pub fn submit(
        &self,
        body: Result<Vec<u8>, RequestError>,
        authorization: Option<&str>,
    ) -> ApiResponse {
        match self.try_submit(body, authorization) {
            Ok(response) => response,
            Err(e) => {
                warn!("Provisioning request rejected: {}", e);
                e.into()
            }
        }
    }

    fn try_submit(
        &self,
        body: Result<Vec<u8>, RequestError>,
        authorization: Option<&str>,
    ) -> Result<ApiResponse, RequestError> {
        let body = body?;
        let parsed = request::parse_provision(&body)?;
        let creds = parsed.wifi();
        let bearer = request::bearer_token(authorization);
        let has_bearer = bearer.is_some();
        let record = parsed.into_record(bearer);

        if self
            .submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RequestError::Closed);
        }

        if let Err(e) = store::lock(&self.store).save_record(&record) {
            error!("Failed to save credentials: {}", e);
            self.submitted.store(false, Ordering::Release);
            return Err(RequestError::SaveFailed);
        }

        info!(
            "Provisioned device {} for SSID '{}' (bearer token: {})",
            record.device_id,
            record.ssid,
            if has_bearer { "yes" } else { "no" }
        );

        Ok(ApiResponse {
            status: 200,
            body: json!({"status": "ok", "message": "Credentials saved"}),
            follow_up: Some(SupervisorEvent::CredentialsSubmitted(creds)),
        })
    }

    /// `GET /status`
    pub fn status(&self) -> ApiResponse {
        let status = self.connectivity.get();
        let body = match (status.mode, status.ip) {
            (LinkMode::Connected, Some(ip)) => {
                json!({"status": "connected", "ip": ip.to_string()})
            }
            (LinkMode::Provisioning, _) | (LinkMode::Connected, None) if self.is_active() => {
                json!({"status": "provisioning", "ip": self.ap_ip.to_string()})
            }
            (LinkMode::Provisioning, _) | (LinkMode::Connected, None) => {
                json!({"status": "provisioning"})
            }
            (LinkMode::Disconnected, _) => json!({"status": "disconnected"}),
        };
        ApiResponse::ok(body)
    }

    /// Stop accepting requests and hand the follow-up to the supervisor.
    ///
    /// Called after the triggering response has been written.
    pub(crate) fn complete(&self, follow_up: SupervisorEvent) {
        self.set_active(false);
        let sender = lock(&self.events);
        if sender.send(follow_up).is_err() {
            error!("Supervisor event channel closed");
        }
    }
}
