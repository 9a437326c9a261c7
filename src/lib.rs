//! Device provisioning firmware library.
//!
//! Captures WiFi credentials over a temporary access point, brings the device
//! onto the target network and hands off to certificate issuance and the
//! mTLS messaging client. Everything except the `esp32`-gated adapters is
//! platform-independent and tested on the host.

pub mod collaborators;
pub mod config;
pub mod connectivity;
pub mod orchestrator;
pub mod radio;
pub mod scan_cache;
pub mod server;
pub mod store;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used items
pub use collaborators::{
    CollaboratorError, ConnectivityProbe, DeviceCertificates, IdentityIssuer, MessagingClient,
};
pub use config::{DeviceCredentialRecord, ProvisionerConfig, WifiCredentials};
pub use connectivity::{ConnectivityCell, ConnectivityStatus, LinkMode};
pub use orchestrator::{LifecycleState, Orchestrator, Timings};
pub use radio::{LinkEvent, NetworkScanEntry, Radio, RadioError, Scanner};
pub use scan_cache::{CacheError, NetworkScanCache, ScanSnapshot, SCAN_CACHE_CAPACITY};
pub use server::{ProvisioningServer, ProvisioningService};
pub use store::{CredentialStore, SharedStore, StoreError};
pub use supervisor::{NetworkSupervisor, SupervisorError, SupervisorEvent, SupervisorState};
