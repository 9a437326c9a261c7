//! Request parsing for the provisioning endpoints.

use crate::config::{DeviceCredentialRecord, WifiCredentials};
use serde_json::{json, Value};
use std::fmt;
use std::io::Read;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest accepted `/provision` body.
pub const MAX_BODY_LEN: usize = 1024;

/// Fields every `/provision` body must carry, in reporting order.
pub const REQUIRED_FIELDS: [&str; 4] = ["ssid", "password", "device_id", "provisioning_token"];

/// Client-visible request failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Body unreadable, empty, or oversized.
    InvalidRequest(String),
    /// Body is not JSON.
    InvalidJson,
    /// Required fields absent, `null`, or not strings.
    MissingFields(Vec<&'static str>),
    /// The store rejected the record.
    SaveFailed,
    /// Another submit already claimed this provisioning session.
    Closed,
}

impl RequestError {
    pub fn status(&self) -> u16 {
        match self {
            Self::SaveFailed => 500,
            Self::Closed => 503,
            _ => 400,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Self::InvalidRequest(message) => {
                json!({"error": "invalid_request", "message": message})
            }
            Self::InvalidJson => json!({"error": "invalid_json"}),
            Self::MissingFields(fields) => {
                json!({"error": "missing_fields", "missing_fields": fields})
            }
            Self::SaveFailed => json!({"error": "save_failed"}),
            Self::Closed => json!({"error": "provisioning_closed"}),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(message) => write!(f, "invalid request: {}", message),
            Self::InvalidJson => write!(f, "invalid JSON"),
            Self::MissingFields(fields) => write!(f, "missing fields: {}", fields.join(", ")),
            Self::SaveFailed => write!(f, "failed to save credentials"),
            Self::Closed => write!(f, "provisioning already submitted"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Parsed `/provision` body.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProvisionRequest {
    pub ssid: String,
    pub password: String,
    pub device_id: String,
    pub provisioning_token: String,
}

impl ProvisionRequest {
    /// Station credentials as submitted. The radio enforces its own limits
    /// when they are applied.
    pub fn wifi(&self) -> WifiCredentials {
        WifiCredentials::unchecked(self.ssid.clone(), self.password.clone())
    }

    pub fn into_record(self, bearer_token: Option<String>) -> DeviceCredentialRecord {
        DeviceCredentialRecord {
            ssid: self.ssid.clone(),
            password: self.password.clone(),
            device_id: self.device_id.clone(),
            provisioning_token: self.provisioning_token.clone(),
            bearer_token,
            provisioned: true,
        }
    }
}

impl fmt::Debug for ProvisionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionRequest")
            .field("ssid", &self.ssid)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Read a request body, enforcing [`MAX_BODY_LEN`].
pub fn read_body<R: Read>(reader: R, declared_len: Option<usize>) -> Result<Vec<u8>, RequestError> {
    if declared_len.map_or(false, |len| len > MAX_BODY_LEN) {
        return Err(RequestError::InvalidRequest("body too large".to_string()));
    }

    let mut body = Vec::new();
    reader
        .take(MAX_BODY_LEN as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| RequestError::InvalidRequest(format!("unreadable body: {}", e)))?;

    if body.len() > MAX_BODY_LEN {
        return Err(RequestError::InvalidRequest("body too large".to_string()));
    }
    if body.is_empty() {
        return Err(RequestError::InvalidRequest("empty body".to_string()));
    }
    Ok(body)
}

/// Parse a `/provision` body.
///
/// Every missing field is reported, not just the first. A JSON value that is
/// not an object has no fields, so all four are missing.
pub fn parse_provision(body: &[u8]) -> Result<ProvisionRequest, RequestError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| RequestError::InvalidJson)?;

    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
    let [ssid, password, device_id, provisioning_token] = REQUIRED_FIELDS.map(field);

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .zip([&ssid, &password, &device_id, &provisioning_token])
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| *name)
        .collect();

    match (ssid, password, device_id, provisioning_token) {
        (Some(ssid), Some(password), Some(device_id), Some(provisioning_token)) => {
            Ok(ProvisionRequest {
                ssid,
                password,
                device_id,
                provisioning_token,
            })
        }
        _ => Err(RequestError::MissingFields(missing)),
    }
}

/// Extract the bearer token from an `Authorization` header value.
///
/// A case-insensitive `Bearer ` prefix is stripped; any other value is used
/// as-is. Blank values count as absent.
pub fn bearer_token(header: Option<&str>) -> Option<String> {
    let value = header?.trim_start();
    let token = match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value.trim_end(),
    };
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
