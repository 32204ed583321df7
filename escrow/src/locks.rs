//! # Identity Locks
//!
//! One mutex per identity, created on first use and shared by every
//! transaction for that identity. Transactions for different identities
//! never contend.
//!
//! Handles are `Arc<Mutex<()>>` and guards are owned
//! ([`ArcMutexGuard`]), so a guard can outlive the registry borrow and is
//! always released on scope exit, panics included.
//!
//! Entries nobody holds are reclaimed by [`IdentityLocks::sweep`], either
//! on demand or from a [`LockSweeper`] thread. An entry is only removed
//! while the map's shard lock is held and the map owns the sole reference,
//! so a caller can never end up locking a handle that was just dropped
//! from the map.

use coinvault_coins::Identity;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Owned guard over one identity's lock.
pub type IdentityGuard = ArcMutexGuard<RawMutex, ()>;

/// Registry of per-identity locks.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: DashMap<Identity, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `identity`'s lock is acquired.
    pub fn lock(&self, identity: Identity) -> IdentityGuard {
        let handle = self.handle(identity);
        handle.lock_arc()
    }

    /// Acquires `identity`'s lock only if it is free right now.
    pub fn try_lock(&self, identity: Identity) -> Option<IdentityGuard> {
        self.handle(identity).try_lock_arc()
    }

    /// Returns `true` if some transaction currently holds the lock.
    pub fn is_locked(&self, identity: Identity) -> bool {
        self.locks
            .get(&identity)
            .map(|m| m.is_locked())
            .unwrap_or(false)
    }

    /// Drops every entry nobody holds or waits on. Returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, handle| Arc::strong_count(handle) > 1 || handle.is_locked());
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.locks.len(), "swept idle identity locks");
        }
        removed
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns `true` if no identity has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn handle(&self, identity: Identity) -> Arc<Mutex<()>> {
        self.locks.entry(identity).or_default().clone()
    }
}

// ---------------------------------------------------------------------------
// LockSweeper
// ---------------------------------------------------------------------------

/// Background thread that sweeps a registry at a fixed interval.
///
/// Stops and joins when dropped.
#[derive(Debug)]
pub struct LockSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LockSweeper {
    /// Starts sweeping `locks` every `interval`.
    pub fn start(locks: Arc<IdentityLocks>, interval: Duration) -> std::io::Result<Self> {
        let (stop, rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("identity-lock-sweeper".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        locks.sweep();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        tracing::debug!(interval_ms = interval.as_millis() as u64, "lock sweeper started");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for LockSweeper {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread with `Disconnected`.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
