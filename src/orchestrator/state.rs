//! Lifecycle states, retry counters and loop timings.

use log::info;
use std::fmt;
use std::time::Duration;

/// Reachability probe attempts before the credentials are discarded.
pub const MAX_PROBE_ATTEMPTS: u32 = 2;

/// Messaging connection attempts before giving up.
pub const MAX_MESSAGING_ATTEMPTS: u32 = 3;

/// Operational liveness checks between heartbeat log lines.
pub const HEARTBEAT_INTERVAL: u32 = 30;

/// Device lifecycle, from boot to an established messaging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Init,
    CheckProvisioned,
    ApMode,
    ConnectingWifi,
    WifiConnected,
    CheckCertificates,
    SubmittingCsr,
    ConnectingMessaging,
    Operational,
    /// Terminal; only a reboot leaves it.
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::CheckProvisioned => "CHECK_PROVISIONED",
            Self::ApMode => "AP_MODE",
            Self::ConnectingWifi => "CONNECTING_WIFI",
            Self::WifiConnected => "WIFI_CONNECTED",
            Self::CheckCertificates => "CHECK_CERTIFICATES",
            Self::SubmittingCsr => "SUBMITTING_CSR",
            Self::ConnectingMessaging => "CONNECTING_MESSAGING",
            Self::Operational => "OPERATIONAL",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Counters that survive across loop iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryCounters {
    /// Failed reachability probes since entering `WifiConnected`.
    pub probe_attempts: u32,
    /// Failed messaging connections since the last success or AP mode.
    pub messaging_attempts: u32,
    /// Liveness checks since the last heartbeat.
    pub operational_checks: u32,
    /// A station connect was requested since entering `ConnectingWifi`.
    pub station_requested: bool,
}

/// Current state plus its counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorState {
    current: LifecycleState,
    pub counters: RetryCounters,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            current: LifecycleState::Init,
            counters: RetryCounters::default(),
        }
    }
}

impl OrchestratorState {
    pub fn current(&self) -> LifecycleState {
        self.current
    }

    /// Move to `next`, applying the counter reset rules.
    ///
    /// Re-entering the current state changes nothing.
    pub fn enter(&mut self, next: LifecycleState) {
        if next == self.current {
            return;
        }
        info!("State: {} -> {}", self.current, next);

        match next {
            LifecycleState::ApMode => {
                self.counters.probe_attempts = 0;
                self.counters.messaging_attempts = 0;
            }
            LifecycleState::WifiConnected => self.counters.probe_attempts = 0,
            LifecycleState::ConnectingWifi => self.counters.station_requested = false,
            LifecycleState::Operational => {
                self.counters.messaging_attempts = 0;
                self.counters.operational_checks = 0;
            }
            _ => {}
        }
        self.current = next;
    }
}

/// Waits and timeouts of the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Pause between loop iterations.
    pub loop_tick: Duration,
    /// Poll interval while waiting for credentials.
    pub ap_poll: Duration,
    /// Backoff after the provisioning listener failed to start.
    pub ap_retry: Duration,
    /// Poll interval while the station associates.
    pub wifi_poll: Duration,
    /// Wait for the network to settle before probing.
    pub probe_settle: Duration,
    /// Wait between failed probes.
    pub probe_retry: Duration,
    /// Backoff after a failed signing request.
    pub csr_backoff: Duration,
    /// Poll interval while the messaging client connects.
    pub messaging_poll: Duration,
    /// Give up on a messaging connection attempt after this long.
    pub messaging_timeout: Duration,
    /// Backoff after a failed messaging attempt.
    pub messaging_backoff: Duration,
    /// Interval between operational liveness checks.
    pub operational_poll: Duration,
    /// Idle wait in the error state.
    pub error_wait: Duration,
    /// Wait between radio teardown and access point restart.
    pub restart_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            loop_tick: Duration::from_millis(100),
            ap_poll: Duration::from_secs(2),
            ap_retry: Duration::from_secs(5),
            wifi_poll: Duration::from_secs(1),
            probe_settle: Duration::from_secs(2),
            probe_retry: Duration::from_secs(5),
            csr_backoff: Duration::from_secs(5),
            messaging_poll: Duration::from_secs(1),
            messaging_timeout: Duration::from_secs(30),
            messaging_backoff: Duration::from_secs(5),
            operational_poll: Duration::from_secs(1),
            error_wait: Duration::from_secs(10),
            restart_delay: crate::supervisor::RESTART_DELAY,
        }
    }
}

impl Timings {
    /// Every wait set to zero.
    pub fn immediate() -> Self {
        Self {
            loop_tick: Duration::ZERO,
            ap_poll: Duration::ZERO,
            ap_retry: Duration::ZERO,
            wifi_poll: Duration::ZERO,
            probe_settle: Duration::ZERO,
            probe_retry: Duration::ZERO,
            csr_backoff: Duration::ZERO,
            messaging_poll: Duration::ZERO,
            messaging_timeout: Duration::ZERO,
            messaging_backoff: Duration::ZERO,
            operational_poll: Duration::ZERO,
            error_wait: Duration::ZERO,
            restart_delay: Duration::ZERO,
        }
    }
}
