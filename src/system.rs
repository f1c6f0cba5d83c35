//! Host facilities the queue polls or holds during an upload
//!
//! - [`Connectivity`] reports the active network, polled synchronously by
//!   readiness checks and by workers before and after a transfer.
//! - [`WakeLock`] keeps the host awake while a worker is transferring.
//!
//! Both are injected through [`Collaborators`](crate::Collaborators); the
//! defaults assume an always-on host with a usable network.

use crate::types::{NetworkInfo, NetworkKind, TaskId};
use std::sync::RwLock;

/// Source of the active network snapshot
pub trait Connectivity: Send + Sync {
    /// Current state of the active network
    fn active_network(&self) -> NetworkInfo;
}

/// Connectivity fixed by the embedding application
///
/// Starts out online over an unmetered wired link. Call [`set`](Self::set)
/// when the host reports a change, then
/// [`UploadQueue::network_changed`](crate::UploadQueue::network_changed) so
/// waiting uploads are re-evaluated.
///
/// # Examples
///
/// ```
/// use upload_queue::system::{Connectivity, StaticConnectivity};
/// use upload_queue::types::NetworkInfo;
///
/// let connectivity = StaticConnectivity::default();
/// assert!(connectivity.active_network().connected);
///
/// connectivity.set(NetworkInfo::offline());
/// assert!(!connectivity.active_network().connected);
/// ```
#[derive(Debug)]
pub struct StaticConnectivity {
    current: RwLock<NetworkInfo>,
}

impl StaticConnectivity {
    /// Report `network` until the next [`set`](Self::set)
    pub fn new(network: NetworkInfo) -> Self {
        Self {
            current: RwLock::new(network),
        }
    }

    /// Replace the reported network
    pub fn set(&self, network: NetworkInfo) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = network;
    }
}

impl Default for StaticConnectivity {
    fn default() -> Self {
        Self::new(NetworkInfo::online(NetworkKind::Ethernet))
    }
}

impl Connectivity for StaticConnectivity {
    fn active_network(&self) -> NetworkInfo {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Held for the duration of one transfer; releases on drop
#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub struct WakeGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeGuard {
    /// Guard that runs `release` when dropped
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Guard with nothing to release
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for WakeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Prevents host suspension while an upload is transferring
pub trait WakeLock: Send + Sync {
    /// Acquire the lock on behalf of `id`
    fn acquire(&self, id: TaskId) -> WakeGuard;
}

/// Wake lock for hosts that never suspend
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, _id: TaskId) -> WakeGuard {
        WakeGuard::noop()
    }
}
