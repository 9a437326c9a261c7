//! Bounded snapshot of visible networks.
//!
//! Scans are slow and the radio can only run one at a time, so the HTTP
//! handlers serve a cached copy. The lock guards copy-in/copy-out only; the
//! scan itself runs unlocked. Both lock acquisitions give up after a bounded
//! wait instead of blocking a handler thread indefinitely.

use crate::radio::{NetworkScanEntry, Scanner};
use log::{debug, error, info};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Maximum number of networks kept.
pub const SCAN_CACHE_CAPACITY: usize = 20;

/// Lock wait when storing a fresh scan.
pub const REFRESH_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Lock wait when reading the snapshot.
pub const READ_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the lock.
const LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Snapshot {
    entries: Vec<NetworkScanEntry>,
    populated: bool,
}

/// Copy of the cache contents handed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSnapshot {
    pub entries: Vec<NetworkScanEntry>,
    /// False until the first successful refresh.
    pub populated: bool,
}

/// Scan cache errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The lock was not acquired within the bounded wait.
    Busy,
    /// The radio scan failed.
    ScanFailed,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "scan cache busy"),
            Self::ScanFailed => write!(f, "network scan failed"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Mutex-guarded scan snapshot.
pub struct NetworkScanCache {
    scanner: Arc<dyn Scanner>,
    inner: Mutex<Snapshot>,
    refresh_wait: Duration,
    read_wait: Duration,
}

impl NetworkScanCache {
    pub fn new(scanner: Arc<dyn Scanner>) -> Self {
        Self::with_waits(scanner, REFRESH_LOCK_WAIT, READ_LOCK_WAIT)
    }

    pub fn with_waits(scanner: Arc<dyn Scanner>, refresh_wait: Duration, read_wait: Duration) -> Self {
        Self {
            scanner,
            inner: Mutex::new(Snapshot::default()),
            refresh_wait,
            read_wait,
        }
    }

    fn lock_within(&self, wait: Duration) -> Option<MutexGuard<'_, Snapshot>> {
        let deadline = Instant::now() + wait;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                // Holders only copy; a panic cannot leave a half-written snapshot
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    thread::sleep(LOCK_POLL.min(deadline - now));
                }
            }
        }
    }

    /// Scan and replace the snapshot.
    ///
    /// Returns the number of entries stored. On failure the previous
    /// snapshot is left untouched.
    pub fn refresh(&self) -> Result<usize, CacheError> {
        let mut entries = self.scanner.scan().map_err(|e| {
            error!("WiFi scan failed: {}", e);
            CacheError::ScanFailed
        })?;
        entries.truncate(SCAN_CACHE_CAPACITY);

        let mut snapshot = self.lock_within(self.refresh_wait).ok_or_else(|| {
            error!("Scan cache lock timeout during refresh");
            CacheError::Busy
        })?;
        snapshot.entries = entries;
        snapshot.populated = true;
        info!("Scan cache updated: {} networks", snapshot.entries.len());
        Ok(snapshot.entries.len())
    }

    /// Copy the current snapshot.
    pub fn read(&self) -> Result<ScanSnapshot, CacheError> {
        let snapshot = self.lock_within(self.read_wait).ok_or(CacheError::Busy)?;
        Ok(ScanSnapshot {
            entries: snapshot.entries.clone(),
            populated: snapshot.populated,
        })
    }

    /// Forget the snapshot so the next session scans again.
    pub fn invalidate(&self) {
        let mut snapshot = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        snapshot.entries.clear();
        snapshot.populated = false;
        debug!("Scan cache invalidated");
    }

    #[cfg(test)]
    fn hold(&self) -> MutexGuard<'_, Snapshot> {
        self.inner.lock().unwrap()
    }
}
