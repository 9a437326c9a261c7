//! Device provisioner binary.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin provisioner` (simulated radio, file store)
//! - **ESP32**: `cargo espflash flash --bin provisioner --features esp32 --release`
//!
//! Settings come from `PROVISIONER_*` variables: read at runtime on the host,
//! baked in at compile time for the device.

use device_provisioner::collaborators::{ConnectivityProbe, IdentityIssuer, MessagingClient};
use device_provisioner::config::ProvisionerConfig;
use device_provisioner::radio::{Radio, Scanner};
use device_provisioner::store::{self, SharedStore};
use device_provisioner::supervisor::event_channel;
use device_provisioner::{NetworkScanCache, NetworkSupervisor, Orchestrator};
use log::{error, info, warn};
use std::sync::Arc;

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[cfg(feature = "esp32")]
fn load_config() -> ProvisionerConfig {
    ProvisionerConfig::from_build_env().unwrap_or_else(|e| {
        error!("Invalid build configuration ({}), using defaults", e);
        ProvisionerConfig::default()
    })
}

#[cfg(not(feature = "esp32"))]
fn load_config() -> ProvisionerConfig {
    match ProvisionerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    }
}

type Collaborators = (
    Box<dyn IdentityIssuer>,
    Box<dyn MessagingClient>,
    Box<dyn ConnectivityProbe>,
);

#[cfg(feature = "esp32")]
fn collaborators(config: &ProvisionerConfig) -> Collaborators {
    use device_provisioner::collaborators::{EspHttpIssuer, EspHttpProbe, EspMqttMessaging};

    if config.csr_pem.is_none() || config.key_pem.is_none() {
        warn!("PROVISIONER_CSR_PEM / PROVISIONER_KEY_PEM not set at build time");
    }
    (
        Box::new(EspHttpIssuer::new(
            config.backend_url.clone(),
            config.csr_pem.clone().unwrap_or_default(),
        )),
        Box::new(EspMqttMessaging::new(
            config.broker_uri.clone(),
            config.key_pem.clone().unwrap_or_default(),
        )),
        Box::new(EspHttpProbe::new(config.probe_target.clone())),
    )
}

#[cfg(not(feature = "esp32"))]
fn collaborators(config: &ProvisionerConfig) -> Collaborators {
    use device_provisioner::collaborators::{DirectoryIssuer, TcpMessagingClient, TcpProbe};

    let cert_dir = config.cert_dir.clone().unwrap_or_else(|| "certs".into());
    info!("Issuing certificates from {}", cert_dir.display());
    (
        Box::new(DirectoryIssuer::new(cert_dir)),
        Box::new(TcpMessagingClient::new(config.broker_uri.clone())),
        Box::new(TcpProbe::new(config.probe_target.clone())),
    )
}

fn main() {
    platform_init();

    info!("=== Device Provisioner starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host");

    let config = load_config();
    let (events_tx, events_rx) = event_channel();

    #[cfg(feature = "esp32")]
    let (store, radio, scanner): (SharedStore, Arc<dyn Radio>, Arc<dyn Scanner>) = {
        use device_provisioner::radio::EspRadio;
        use device_provisioner::store::NvsStore;
        use esp_idf_hal::peripherals::Peripherals;
        use esp_idf_svc::eventloop::EspSystemEventLoop;
        use esp_idf_svc::nvs::EspDefaultNvsPartition;

        let peripherals = Peripherals::take().expect("Failed to take peripherals");
        let sysloop = EspSystemEventLoop::take().expect("Failed to take event loop");
        let partition = EspDefaultNvsPartition::take().expect("Failed to initialize NVS");

        let store = NvsStore::open(partition.clone()).expect("Failed to open NVS namespace");
        let radio = EspRadio::new(
            peripherals.modem,
            sysloop,
            Some(partition),
            events_tx.clone(),
        )
        .expect("Failed to initialize WiFi");
        let radio = Arc::new(radio);
        (store::shared(store), radio.clone(), radio)
    };

    #[cfg(not(feature = "esp32"))]
    let (store, radio, scanner): (SharedStore, Arc<dyn Radio>, Arc<dyn Scanner>) = {
        use device_provisioner::radio::HostRadio;
        use device_provisioner::store::FileStore;
        use device_provisioner::NetworkScanEntry;

        let store = FileStore::open_default().expect("Failed to open credential store");
        info!("Credential store: {}", store.path().display());

        let networks = config
            .host_networks
            .iter()
            .enumerate()
            .map(|(i, ssid)| NetworkScanEntry {
                ssid: ssid.clone(),
                rssi: (-45 - 7 * i as i32).max(-95) as i8,
                channel: 6,
                secure: true,
            })
            .collect();
        let radio = Arc::new(HostRadio::new(events_tx.clone(), networks));
        (store::shared(store), radio.clone(), radio)
    };

    if config.erase_on_boot {
        warn!("Erase-on-boot enabled: clearing all provisioning data");
        if let Err(e) = store::lock(&store).erase_all() {
            warn!("Failed to clear provisioning data: {}", e);
        }
    }

    let cache = Arc::new(NetworkScanCache::new(scanner));
    let supervisor = NetworkSupervisor::new(
        radio,
        store.clone(),
        cache,
        &config,
        (events_tx, events_rx),
    );

    let (issuer, messaging, probe) = collaborators(&config);
    let mut orchestrator = Orchestrator::new(
        supervisor,
        store,
        issuer,
        messaging,
        probe,
        config.timings.clone(),
    );
    orchestrator.run()
}
