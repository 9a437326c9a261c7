//! ESP32 adapters over `esp-idf-svc`.

use super::{
    parse_sign_response, CollaboratorError, ConnectivityProbe, DeviceCertificates,
    IdentityIssuer, MessagingClient, SignRequest,
};
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::http::Method;
use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration};
use esp_idf_svc::tls::X509;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// HTTP timeout for the probe and the signing request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest signing response accepted (two PEM certificates plus JSON).
const MAX_SIGN_RESPONSE: usize = 8192;

fn https_connection() -> Result<EspHttpConnection, CollaboratorError> {
    let conn = EspHttpConnection::new(&HttpConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
        ..Default::default()
    })?;
    Ok(conn)
}

/// Leak a PEM string as a NUL-terminated static buffer for ESP-TLS.
///
/// Called once per messaging start, so the leak is bounded by the retry count.
fn leak_pem(pem: &str) -> X509<'static> {
    let mut bytes = pem.as_bytes().to_vec();
    bytes.push(0);
    X509::pem_until_nul(Box::leak(bytes.into_boxed_slice()))
}

/// HTTPS GET against a known endpoint; status 200 means reachable.
pub struct EspHttpProbe {
    url: String,
}

impl EspHttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn get_status(&self) -> Result<u16, CollaboratorError> {
        let mut conn = https_connection()?;
        conn.initiate_request(Method::Get, &self.url, &[])?;
        conn.initiate_response()?;
        Ok(conn.status())
    }
}

impl ConnectivityProbe for EspHttpProbe {
    fn check(&mut self) -> bool {
        match self.get_status() {
            Ok(200) => {
                info!("Internet reachable ({})", self.url);
                true
            }
            Ok(status) => {
                warn!("Probe returned HTTP {}", status);
                false
            }
            Err(e) => {
                warn!("Probe failed: {}", e);
                false
            }
        }
    }
}

/// Submits the device CSR to `{backend}/api/v1/sign-csr`.
pub struct EspHttpIssuer {
    backend_url: String,
    csr_pem: String,
}

impl EspHttpIssuer {
    pub fn new(backend_url: impl Into<String>, csr_pem: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            csr_pem: csr_pem.into(),
        }
    }
}

impl IdentityIssuer for EspHttpIssuer {
    fn submit_request(
        &mut self,
        device_id: &str,
        provisioning_token: &str,
    ) -> Result<DeviceCertificates, CollaboratorError> {
        if self.csr_pem.is_empty() {
            return Err(CollaboratorError::NotConfigured("certificate signing request"));
        }
        let url = format!("{}/api/v1/sign-csr", self.backend_url);
        let body = serde_json::to_vec(&SignRequest {
            device_id,
            csr: &self.csr_pem,
            provisioning_token,
        })
        .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        let content_length = body.len().to_string();

        info!("Submitting CSR to {}", url);
        let mut conn = https_connection()?;
        conn.initiate_request(
            Method::Post,
            &url,
            &[
                ("Content-Type", "application/json"),
                ("Content-Length", &content_length),
            ],
        )?;

        let mut written = 0;
        while written < body.len() {
            written += conn.write(&body[written..])?;
        }
        conn.initiate_response()?;
        let status = conn.status();

        let mut response = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = conn.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if response.len() + n > MAX_SIGN_RESPONSE {
                return Err(CollaboratorError::InvalidResponse(
                    "response too large".to_string(),
                ));
            }
            response.extend_from_slice(&buf[..n]);
        }
        debug!("Signing backend: HTTP {} ({} bytes)", status, response.len());

        parse_sign_response(status, &response)
    }
}

/// mTLS MQTT session.
pub struct EspMqttMessaging {
    broker_uri: String,
    key_pem: String,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl EspMqttMessaging {
    pub fn new(broker_uri: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            key_pem: key_pem.into(),
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MessagingClient for EspMqttMessaging {
    fn start(&mut self, certs: &DeviceCertificates) -> Result<(), CollaboratorError> {
        if self.client.is_some() {
            warn!("MQTT client already started");
            return Ok(());
        }
        if self.key_pem.is_empty() {
            return Err(CollaboratorError::NotConfigured("device private key"));
        }

        let conf = MqttClientConfiguration {
            server_certificate: Some(leak_pem(&certs.ca_certificate_pem)),
            client_certificate: Some(leak_pem(&certs.certificate_pem)),
            private_key: Some(leak_pem(&self.key_pem)),
            ..Default::default()
        };

        let connected = self.connected.clone();
        info!("Connecting to MQTT broker: {}", self.broker_uri);
        let client = EspMqttClient::new_cb(&self.broker_uri, &conf, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("MQTT connected");
                    connected.store(true, Ordering::Release);
                }
                EventPayload::Disconnected => {
                    warn!("MQTT disconnected");
                    connected.store(false, Ordering::Release);
                }
                EventPayload::Error(e) => error!("MQTT error: {:?}", e),
                _ => {}
            }
        })?;
        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stop(&mut self) {
        if self.client.take().is_some() {
            self.connected.store(false, Ordering::Release);
            info!("MQTT client stopped");
        }
    }
}
