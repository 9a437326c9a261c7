//! Downstream subsystems the orchestrator hands off to.
//!
//! The orchestrator only sees these traits. Concrete adapters:
//!
//! - **ESP32** (`esp32` feature): HTTPS probe, HTTPS CSR issuer, mTLS MQTT
//!   client, all over `esp-idf-svc`
//! - **Host**: TCP probe, directory-backed issuer, TCP session client

#[cfg(feature = "esp32")]
mod esp;
mod host;

#[cfg(feature = "esp32")]
pub use esp::{EspHttpIssuer, EspHttpProbe, EspMqttMessaging};
pub use host::{DirectoryIssuer, TcpMessagingClient, TcpProbe};

use std::fmt;

/// Certificates returned by identity issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCertificates {
    pub certificate_pem: String,
    pub ca_certificate_pem: String,
}

/// Exchanges the device's signing request for certificates.
pub trait IdentityIssuer: Send {
    fn submit_request(
        &mut self,
        device_id: &str,
        provisioning_token: &str,
    ) -> Result<DeviceCertificates, CollaboratorError>;
}

/// Secure messaging session (mTLS).
pub trait MessagingClient: Send {
    /// Begin connecting. Completion is observed through [`is_connected`](Self::is_connected).
    fn start(&mut self, certs: &DeviceCertificates) -> Result<(), CollaboratorError>;
    fn is_connected(&self) -> bool;
    fn stop(&mut self);
}

/// Checks that the upstream network actually reaches the internet.
pub trait ConnectivityProbe: Send {
    fn check(&mut self) -> bool;
}

/// Errors from collaborator adapters.
#[derive(Debug)]
pub enum CollaboratorError {
    /// Required local material (CSR, key, certificate files) is missing.
    NotConfigured(&'static str),
    /// The remote side answered with an unexpected HTTP status.
    Status(u16),
    /// The response could not be interpreted.
    InvalidResponse(String),
    /// Transport failure.
    Io(std::io::Error),
    /// ESP-IDF call failed.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured(what) => write!(f, "{} not configured", what),
            Self::Status(code) => write!(f, "unexpected HTTP status {}", code),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "ESP-IDF error: {:?}", e),
        }
    }
}

impl std::error::Error for CollaboratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CollaboratorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for CollaboratorError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}

/// Body sent to the signing backend.
#[derive(Debug, serde::Serialize)]
pub(crate) struct SignRequest<'a> {
    pub device_id: &'a str,
    pub csr: &'a str,
    pub provisioning_token: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct PemContent {
    content: String,
}

/// Body returned by the signing backend.
#[derive(Debug, serde::Deserialize)]
struct SignResponse {
    certificate: PemContent,
    ca_certificate: PemContent,
}

/// Interpret a signing backend response. 200 and 201 both mean success.
pub(crate) fn parse_sign_response(
    status: u16,
    body: &[u8],
) -> Result<DeviceCertificates, CollaboratorError> {
    if status != 200 && status != 201 {
        return Err(CollaboratorError::Status(status));
    }
    let parsed: SignResponse = serde_json::from_slice(body)
        .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
    if parsed.certificate.content.is_empty() || parsed.ca_certificate.content.is_empty() {
        return Err(CollaboratorError::InvalidResponse(
            "empty certificate".to_string(),
        ));
    }
    Ok(DeviceCertificates {
        certificate_pem: parsed.certificate.content,
        ca_certificate_pem: parsed.ca_certificate.content,
    })
}
