//! Host development adapters.
//!
//! On a development machine the radio is simulated, so these adapters stand
//! in for the backend services with plain TCP and files.

use super::{
    CollaboratorError, ConnectivityProbe, DeviceCertificates, IdentityIssuer, MessagingClient,
};
use log::{debug, info, warn};
use std::fs;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for TCP connects, matching the device probe.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// File names read by [`DirectoryIssuer`].
pub const DEVICE_CERT_FILE: &str = "device_cert.pem";
pub const CA_CERT_FILE: &str = "ca_cert.pem";

/// Split a URL or `host:port` into a socket address string.
///
/// `https://example.com/api` becomes `example.com:443`; a bare host gets
/// `default_port`.
fn authority(target: &str, default_port: u16) -> String {
    let (scheme_port, rest) = match target.split_once("://") {
        Some((scheme, rest)) => {
            let port = match scheme {
                "https" => 443,
                "http" => 80,
                "mqtts" | "ssl" => 8883,
                "mqtt" | "tcp" => 1883,
                _ => default_port,
            };
            (port, rest)
        }
        None => (default_port, target),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    if host.rsplit_once(':').map_or(false, |(_, p)| p.parse::<u16>().is_ok()) {
        host.to_string()
    } else {
        format!("{}:{}", host, scheme_port)
    }
}

fn resolve(target: &str, default_port: u16) -> io::Result<SocketAddr> {
    authority(target, default_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {}", target)))
}

/// Reachability probe that opens a TCP connection to the target.
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ConnectivityProbe for TcpProbe {
    fn check(&mut self) -> bool {
        let addr = match resolve(&self.target, 443) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Probe target {} unresolvable: {}", self.target, e);
                return false;
            }
        };
        match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(_) => {
                info!("Internet reachable via {}", addr);
                true
            }
            Err(e) => {
                warn!("Probe to {} failed: {}", addr, e);
                false
            }
        }
    }
}

/// Issuer that hands out pre-issued certificates from a directory.
///
/// Expects [`DEVICE_CERT_FILE`] and [`CA_CERT_FILE`] in `dir`.
pub struct DirectoryIssuer {
    dir: PathBuf,
}

impl DirectoryIssuer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_pem(&self, name: &str) -> Result<String, CollaboratorError> {
        let path = self.dir.join(name);
        let pem = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CollaboratorError::NotConfigured("certificate file")
            } else {
                CollaboratorError::Io(e)
            }
        })?;
        if !pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(CollaboratorError::InvalidResponse(format!(
                "{:?} is not a PEM certificate",
                path
            )));
        }
        Ok(pem)
    }
}

impl IdentityIssuer for DirectoryIssuer {
    fn submit_request(
        &mut self,
        device_id: &str,
        _provisioning_token: &str,
    ) -> Result<DeviceCertificates, CollaboratorError> {
        info!("Issuing certificates for {} from {:?}", device_id, self.dir);
        Ok(DeviceCertificates {
            certificate_pem: self.read_pem(DEVICE_CERT_FILE)?,
            ca_certificate_pem: self.read_pem(CA_CERT_FILE)?,
        })
    }
}

/// Messaging client that holds a plain TCP session to the broker.
pub struct TcpMessagingClient {
    broker: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpMessagingClient {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
        }
    }
}

impl MessagingClient for TcpMessagingClient {
    fn start(&mut self, certs: &DeviceCertificates) -> Result<(), CollaboratorError> {
        if self.stream.is_some() {
            warn!("Messaging client already started");
            return Ok(());
        }
        debug!(
            "Session certificate: {} bytes",
            certs.certificate_pem.len()
        );
        let addr = resolve(&self.broker, 8883)?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_nonblocking(true)?;
        info!("Messaging session open to {}", addr);
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        let mut buf = [0u8; 1];
        match stream.peek(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            info!("Messaging session closed");
        }
    }
}
