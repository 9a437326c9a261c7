//! ESP32 radio over `EspWifi`.
//!
//! Mode changes go through the `EspWifi` driver. Link notifications are taken
//! from the default event loop with a raw handler so the disconnect reason
//! code reaches the supervisor unchanged.

use super::{LinkEvent, NetworkScanEntry, Radio, RadioError, Scanner};
use crate::config::{ApSettings, WifiCredentials};
use crate::supervisor::{EventSender, SupervisorEvent};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
};
use esp_idf_sys as sys;
use log::{debug, info, warn};
use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// WiFi radio for ESP32.
pub struct EspRadio {
    wifi: Mutex<EspWifi<'static>>,
}

impl EspRadio {
    /// Create the driver and start forwarding link events to `events`.
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        events: EventSender,
    ) -> Result<Self, RadioError> {
        let wifi = EspWifi::new(modem, sysloop, nvs)?;
        register_event_handlers(events)?;
        Ok(Self {
            wifi: Mutex::new(wifi),
        })
    }

    fn wifi(&self) -> MutexGuard<'_, EspWifi<'static>> {
        self.wifi.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn client_configuration(creds: &WifiCredentials) -> Result<ClientConfiguration, RadioError> {
    if let Err(e) = creds.validate() {
        warn!("Station credentials rejected: {}", e);
        return Err(RadioError::InvalidConfig("station credentials"));
    }
    Ok(ClientConfiguration {
        ssid: creds
            .ssid()
            .try_into()
            .map_err(|_| RadioError::InvalidConfig("ssid"))?,
        password: creds
            .password()
            .try_into()
            .map_err(|_| RadioError::InvalidConfig("password"))?,
        auth_method: if creds.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    })
}

impl Scanner for EspRadio {
    fn scan(&self) -> Result<Vec<NetworkScanEntry>, RadioError> {
        let mut wifi = self.wifi();
        let found = wifi.scan()?;
        debug!("Scan found {} networks", found.len());
        Ok(found
            .into_iter()
            .map(|ap| NetworkScanEntry {
                ssid: ap.ssid.as_str().to_string(),
                rssi: ap.signal_strength,
                channel: ap.channel,
                secure: ap.auth_method.map_or(false, |a| a != AuthMethod::None),
            })
            .collect())
    }
}

impl Radio for EspRadio {
    fn start_access_point(&self, ap: &ApSettings) -> Result<(), RadioError> {
        let ap_config = AccessPointConfiguration {
            ssid: ap
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("ap ssid"))?,
            password: ap
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("ap password"))?,
            channel: ap.channel,
            auth_method: if ap.is_open() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            max_connections: u16::from(ap.max_connections),
            ..Default::default()
        };

        let mut wifi = self.wifi();
        if wifi.is_started()? {
            wifi.stop()?;
        }
        wifi.set_configuration(&Configuration::Mixed(
            ClientConfiguration::default(),
            ap_config,
        ))?;
        wifi.start()?;
        info!("WiFi AP started: SSID={}", ap.ssid);
        Ok(())
    }

    fn connect_station(&self, creds: &WifiCredentials) -> Result<(), RadioError> {
        let config = Configuration::Client(client_configuration(creds)?);

        let mut wifi = self.wifi();
        if wifi.is_started()? {
            wifi.stop()?;
        }
        wifi.set_configuration(&config)?;
        wifi.start()?;
        wifi.connect()?;
        info!("Connecting to WiFi: {}", creds.ssid());
        Ok(())
    }

    fn reassociate(&self) -> Result<(), RadioError> {
        self.wifi().connect()?;
        Ok(())
    }

    fn stop(&self) -> Result<(), RadioError> {
        let mut wifi = self.wifi();
        if wifi.is_started()? {
            wifi.stop()?;
        }
        info!("WiFi stopped");
        Ok(())
    }
}

fn ipv4(addr: &sys::esp_ip4_addr_t) -> Ipv4Addr {
    // lwIP keeps addresses in network byte order
    Ipv4Addr::from(addr.addr.to_le_bytes())
}

/// Translate a raw default-loop event into a [`LinkEvent`].
///
/// # Safety
///
/// `data` must point to the payload type ESP-IDF documents for `base`/`id`.
unsafe fn translate(base: sys::esp_event_base_t, id: i32, data: *mut c_void) -> Option<LinkEvent> {
    let id = id as u32;
    if base == sys::WIFI_EVENT {
        match id {
            sys::wifi_event_t_WIFI_EVENT_STA_START => Some(LinkEvent::StationStarted),
            sys::wifi_event_t_WIFI_EVENT_STA_CONNECTED => Some(LinkEvent::StationConnected),
            sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let event = &*(data as *const sys::wifi_event_sta_disconnected_t);
                Some(LinkEvent::StationDisconnected {
                    reason: u16::from(event.reason),
                })
            }
            sys::wifi_event_t_WIFI_EVENT_AP_STACONNECTED => {
                let event = &*(data as *const sys::wifi_event_ap_staconnected_t);
                Some(LinkEvent::ApClientJoined { mac: event.mac })
            }
            sys::wifi_event_t_WIFI_EVENT_AP_STADISCONNECTED => {
                let event = &*(data as *const sys::wifi_event_ap_stadisconnected_t);
                Some(LinkEvent::ApClientLeft { mac: event.mac })
            }
            _ => None,
        }
    } else if base == sys::IP_EVENT {
        match id {
            sys::ip_event_t_IP_EVENT_STA_GOT_IP => {
                let event = &*(data as *const sys::ip_event_got_ip_t);
                Some(LinkEvent::GotIp(ipv4(&event.ip_info.ip)))
            }
            sys::ip_event_t_IP_EVENT_AP_STAIPASSIGNED => {
                let event = &*(data as *const sys::ip_event_ap_staipassigned_t);
                Some(LinkEvent::ApAssignedIp(ipv4(&event.ip)))
            }
            _ => None,
        }
    } else {
        None
    }
}

unsafe extern "C" fn on_event(
    arg: *mut c_void,
    base: sys::esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let sender = &*(arg as *const Mutex<EventSender>);
    if let Some(event) = translate(base, id, data) {
        let sender = sender.lock().unwrap_or_else(PoisonError::into_inner);
        // Receiver gone means the process is shutting down
        let _ = sender.send(SupervisorEvent::Link(event));
    }
}

/// Register [`on_event`] for WiFi and IP events.
///
/// The sender lives for the rest of the program; handlers are never
/// unregistered.
fn register_event_handlers(events: EventSender) -> Result<(), RadioError> {
    let arg = Box::into_raw(Box::new(Mutex::new(events))) as *mut c_void;
    unsafe {
        sys::esp!(sys::esp_event_handler_instance_register(
            sys::WIFI_EVENT,
            sys::ESP_EVENT_ANY_ID,
            Some(on_event),
            arg,
            std::ptr::null_mut(),
        ))?;
        sys::esp!(sys::esp_event_handler_instance_register(
            sys::IP_EVENT,
            sys::ESP_EVENT_ANY_ID,
            Some(on_event),
            arg,
            std::ptr::null_mut(),
        ))?;
    }
    Ok(())
}
