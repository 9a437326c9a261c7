//! Provisioning HTTP server.
//!
//! Exposed only while the access point is up. Endpoints:
//!
//! - `GET /local-wifi?refresh=true` - visible networks
//! - `POST /provision` - submit credentials
//! - `GET /status` - connectivity status
//!
//! Uses `tiny_http` which works on both host and ESP32 (via std::net). A fixed
//! pool of worker threads shares one listener. The first `/provision` to reach
//! the store claims the session: every request after it is refused with 503,
//! and once its response is written every worker stops.
//!
//! # Example
//!
//! ```text
//! $ curl -X POST http://192.168.4.1/provision \
//!     -H 'Authorization: Bearer abc' \
//!     -d '{"ssid":"Home","password":"secret123","device_id":"d1","provisioning_token":"t1"}'
//! {"message":"Credentials saved","status":"ok"}
//! ```

pub mod request;
mod service;

pub use request::{ProvisionRequest, RequestError, MAX_BODY_LEN};
pub use service::{ApiResponse, ProvisioningService};

use log::{debug, error, info, trace, warn};
use serde_json::json;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};

/// Worker poll interval; bounds how long `stop()` waits for a worker.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on bytes discarded from a rejected request body.
const DRAIN_LIMIT: u64 = 16 * 1024;

/// Handle to the running provisioning server.
pub struct ProvisioningServer {
    server: Arc<Server>,
    service: Arc<ProvisioningService>,
    workers: Vec<thread::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ProvisioningServer {
    /// Bind and start `workers` handler threads.
    pub fn start(
        bind_addr: SocketAddr,
        workers: usize,
        service: Arc<ProvisioningService>,
    ) -> Result<Self, io::Error> {
        let server = Server::http(bind_addr)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let server = Arc::new(server);
        let local_addr = server.server_addr().to_ip();

        service.set_active(true);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let worker_server = server.clone();
            let worker_service = service.clone();
            let spawned = thread::Builder::new()
                .name(format!("prov-http-{}", i))
                .spawn(move || run_worker(&worker_server, &worker_service));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    service.set_active(false);
                    server.unblock();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Provisioning server listening on http://{} ({} workers)",
            local_addr.map_or_else(|| bind_addr.to_string(), |a| a.to_string()),
            handles.len()
        );

        Ok(Self {
            server,
            service,
            workers: handles,
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether workers still accept requests.
    pub fn is_active(&self) -> bool {
        self.service.is_active()
    }

    /// Stop accepting requests and join the workers.
    ///
    /// Note: May take up to 100ms due to polling interval.
    pub fn stop(&mut self) {
        self.service.set_active(false);
        self.server.unblock();
        let joined = self.workers.len();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if joined > 0 {
            info!("Provisioning server stopped");
        }
    }
}

impl Drop for ProvisioningServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pre-created headers shared by every response from one worker.
struct Headers {
    content_type: Header,
    allow_get: Header,
    allow_post: Header,
}

impl Headers {
    fn new() -> Self {
        Self {
            content_type: Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                .expect("static header"),
            allow_get: Header::from_bytes(&b"Allow"[..], &b"GET"[..]).expect("static header"),
            allow_post: Header::from_bytes(&b"Allow"[..], &b"POST"[..]).expect("static header"),
        }
    }
}

fn run_worker(server: &Server, service: &ProvisioningService) {
    let headers = Headers::new();

    loop {
        if !service.is_active() {
            debug!("Provisioning worker exiting");
            break;
        }

        match server.recv_timeout(RECV_TIMEOUT) {
            Ok(Some(request)) => handle(request, service, &headers),
            Ok(None) => {
                // Timeout, check active flag and continue
            }
            Err(e) => {
                error!("Server error: {}", e);
                break;
            }
        }
    }
}

/// Traces the exchange around [`dispatch`], writes the response, then
/// releases any follow-up event.
fn handle(mut request: Request, service: &ProvisioningService, headers: &Headers) {
    let method = request.method().clone();
    let url = request.url().to_string();
    trace!("--> {} {}", method, url);

    let (response, allow) = if service.is_submitted() {
        drain(&mut request);
        (ApiResponse::from(RequestError::Closed), None)
    } else {
        dispatch(&mut request, &method, &url, service)
    };
    debug!("{} {} -> {}", method, url, response.status);
    trace!("<-- {}", response.body);

    let mut reply = Response::from_string(response.body.to_string())
        .with_status_code(response.status)
        .with_header(headers.content_type.clone());
    match allow {
        Some(Method::Get) => reply = reply.with_header(headers.allow_get.clone()),
        Some(Method::Post) => reply = reply.with_header(headers.allow_post.clone()),
        _ => {}
    }

    if let Err(e) = request.respond(reply) {
        warn!("Failed to send response: {}", e);
    }

    if let Some(follow_up) = response.follow_up {
        service.complete(follow_up);
    }
}

/// Route a request. The second value is the method to advertise on 405.
fn dispatch(
    request: &mut Request,
    method: &Method,
    url: &str,
    service: &ProvisioningService,
) -> (ApiResponse, Option<Method>) {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    };

    match (path, method) {
        ("/local-wifi", Method::Get) => (service.scan(refresh_requested(query)), None),
        ("/provision", Method::Post) => {
            let authorization = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            let declared = request.body_length();
            let body = request::read_body(request.as_reader(), declared);
            if body.is_err() {
                drain(request);
            }
            (service.submit(body, authorization.as_deref()), None)
        }
        ("/status", Method::Get) => (service.status(), None),
        ("/local-wifi", _) | ("/status", _) => (method_not_allowed(), Some(Method::Get)),
        ("/provision", _) => (method_not_allowed(), Some(Method::Post)),
        _ => (
            ApiResponse {
                status: 404,
                body: json!({"error": "not_found"}),
                follow_up: None,
            },
            None,
        ),
    }
}

/// Discard an unread body so the error response is not reset.
fn drain(request: &mut Request) {
    let _ = io::copy(&mut request.as_reader().take(DRAIN_LIMIT), &mut io::sink());
}

fn method_not_allowed() -> ApiResponse {
    ApiResponse {
        status: 405,
        body: json!({"error": "method_not_allowed"}),
        follow_up: None,
    }
}

/// `refresh=true` or `refresh=1` anywhere in the query string.
fn refresh_requested(query: &str) -> bool {
    query.split('&').any(|pair| match pair.split_once('=') {
        Some(("refresh", value)) => value.eq_ignore_ascii_case("true") || value == "1",
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityCell;
    use crate::scan_cache::NetworkScanCache;
    use crate::store::{CredentialStore, MemoryStore};
    use crate::supervisor::{event_channel, SupervisorEvent};
    use crate::test_support::{network, FakeScanner};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};
    use std::sync::mpsc::Receiver;
    use std::sync::{Barrier, Mutex};

    struct Running {
        server: ProvisioningServer,
        store: Arc<Mutex<MemoryStore>>,
        events: Receiver<SupervisorEvent>,
    }

    fn start() -> Running {
        start_with_workers(2)
    }

    fn start_with_workers(workers: usize) -> Running {
        let scanner = Arc::new(FakeScanner::new(vec![network("HomeNet")]));
        let cache = Arc::new(NetworkScanCache::new(scanner));
        cache.refresh().unwrap();
        let store = Arc::new(Mutex::new(MemoryStore::new()));
        let (tx, rx) = event_channel();
        let service = Arc::new(ProvisioningService::new(
            store.clone(),
            cache,
            ConnectivityCell::new(),
            tx,
            Ipv4Addr::new(192, 168, 4, 1),
            Duration::from_secs(5),
        ));
        let server =
            ProvisioningServer::start("127.0.0.1:0".parse().unwrap(), workers, service).unwrap();
        Running {
            server,
            store,
            events: rx,
        }
    }

    fn exchange(addr: SocketAddr, raw: &str) -> io::Result<String> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(raw.as_bytes())?;
        let mut response = String::new();
        stream.read_to_string(&mut response)?;
        Ok(response)
    }

    fn send(server: &ProvisioningServer, raw: &str) -> String {
        exchange(server.local_addr().unwrap(), raw).unwrap()
    }

    fn post_request(path: &str, auth: Option<&str>, body: &str) -> String {
        let auth = auth
            .map(|a| format!("Authorization: {}\r\n", a))
            .unwrap_or_default();
        format!(
            "POST {} HTTP/1.1\r\nHost: test\r\n{}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            path,
            auth,
            body.len(),
            body
        )
    }

    fn get(server: &ProvisioningServer, path: &str) -> String {
        send(
            server,
            &format!(
                "GET {} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
                path
            ),
        )
    }

    fn post(server: &ProvisioningServer, path: &str, auth: Option<&str>, body: &str) -> String {
        send(server, &post_request(path, auth, body))
    }

    fn provision_body(ssid: &str) -> String {
        format!(
            r#"{{"ssid":"{}","password":"secret123","device_id":"d1","provisioning_token":"t1"}}"#,
            ssid
        )
    }

    fn json_body(response: &str) -> serde_json::Value {
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_refresh_query() {
        assert!(refresh_requested("refresh=true"));
        assert!(refresh_requested("a=b&refresh=1"));
        assert!(refresh_requested("refresh=TRUE"));
        assert!(!refresh_requested("refresh=false"));
        assert!(!refresh_requested(""));
    }

    #[test]
    fn test_http_scan_and_status() {
        let running = start();

        let response = get(&running.server, "/local-wifi");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("application/json"));
        let body = json_body(&response);
        assert_eq!(body["count"], 1);
        assert_eq!(body["cached"], true);
        assert_eq!(body["networks"][0]["ssid"], "HomeNet");

        let response = get(&running.server, "/status");
        assert_eq!(json_body(&response), json!({"status": "disconnected"}));
    }

    #[test]
    fn test_http_not_found_and_method_not_allowed() {
        let running = start();

        let response = get(&running.server, "/nope");
        assert!(response.starts_with("HTTP/1.1 404"));
        assert_eq!(json_body(&response), json!({"error": "not_found"}));

        let response = get(&running.server, "/provision");
        assert!(response.starts_with("HTTP/1.1 405"));
        assert!(response.contains("Allow: POST"));
    }

    #[test]
    fn test_http_missing_fields() {
        let running = start();
        let response = post(&running.server, "/provision", None, r#"{"ssid":"X"}"#);
        assert!(response.starts_with("HTTP/1.1 400"));
        assert_eq!(
            json_body(&response)["missing_fields"],
            json!(["password", "device_id", "provisioning_token"])
        );
        assert!(running.server.is_active());
    }

    #[test]
    fn test_http_provision_stops_listener() {
        let mut running = start();
        let body = r#"{"ssid":"HomeNet","password":"secret123","device_id":"d1","provisioning_token":"t1"}"#;

        let response = post(&running.server, "/provision", Some("Bearer xyz"), body);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert_eq!(
            json_body(&response),
            json!({"status": "ok", "message": "Credentials saved"})
        );

        let event = running
            .events
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert!(matches!(event, SupervisorEvent::CredentialsSubmitted(_)));
        assert!(!running.server.is_active());

        let store = running.store.lock().unwrap();
        assert!(store.is_provisioned().unwrap());
        assert_eq!(store.load_bearer_token().unwrap().as_deref(), Some("xyz"));
        drop(store);

        running.server.stop();
    }

    #[test]
    fn test_http_concurrent_submits_single_winner() {
        let mut running = start_with_workers(4);
        let addr = running.server.local_addr().unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let clients: Vec<_> = ["First", "Second"]
            .into_iter()
            .map(|ssid| {
                let barrier = barrier.clone();
                let raw = post_request("/provision", None, &provision_body(ssid));
                thread::spawn(move || {
                    barrier.wait();
                    // A request left unanswered once the workers stop reads as empty
                    (ssid, exchange(addr, &raw).unwrap_or_default())
                })
            })
            .collect();
        let results: Vec<(&str, String)> =
            clients.into_iter().map(|c| c.join().unwrap()).collect();

        let winners: Vec<&str> = results
            .iter()
            .filter(|(_, response)| response.starts_with("HTTP/1.1 200"))
            .map(|(ssid, _)| *ssid)
            .collect();
        assert_eq!(winners.len(), 1, "responses: {:?}", results);
        for (_, response) in results.iter().filter(|(s, _)| *s != winners[0]) {
            assert!(
                response.is_empty() || response.starts_with("HTTP/1.1 503"),
                "unexpected response: {}",
                response
            );
        }

        let event = running
            .events
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        match event {
            SupervisorEvent::CredentialsSubmitted(creds) => assert_eq!(creds.ssid(), winners[0]),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(running.events.try_recv().is_err());

        let record = running.store.lock().unwrap().load_record().unwrap().unwrap();
        assert_eq!(record.ssid, winners[0]);

        running.server.stop();
    }

    #[test]
    fn test_http_requests_refused_after_claim() {
        let running = start();
        let service = running.server.service.clone();
        assert_eq!(
            service
                .submit(Ok(provision_body("HomeNet").into_bytes()), None)
                .status,
            200
        );

        // Claimed but not yet completed: the listener is still up
        assert!(running.server.is_active());
        let response = get(&running.server, "/local-wifi");
        assert!(response.starts_with("HTTP/1.1 503"));
        assert_eq!(json_body(&response), json!({"error": "provisioning_closed"}));

        let response = post(&running.server, "/provision", None, &provision_body("Other"));
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(running.events.try_recv().is_err());
    }

    #[test]
    fn test_http_oversized_body() {
        let running = start();
        let body = "x".repeat(MAX_BODY_LEN + 10);
        let response = post(&running.server, "/provision", None, &body);
        assert!(response.starts_with("HTTP/1.1 400"));
        assert_eq!(json_body(&response)["error"], "invalid_request");
    }
}
