//! Advisory, process-local locks keyed by device.
//!
//! Reconcilers of different resource kinds may target the same device at the
//! same time. Each of them claims the device key before talking to the
//! provider and gives it back when done, so that at most one configuration
//! push is in flight per device. Acquisition never waits: a caller that
//! loses the race is expected to requeue itself.
//!
//! Locks are not persisted. A restarted operator starts with an empty map and
//! simply re-acquires on the next reconcile.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Someone else is configuring this device, try again later
    #[error("lock on {key} is already held by {holder}")]
    AlreadyHeld { key: String, holder: String },

    #[error("{holder} tried to acquire the lock on {key} it already holds")]
    Reentrant { key: String, holder: String },

    #[error("{holder} cannot release the lock on {key} held by {owner}")]
    NotHolder {
        key: String,
        holder: String,
        owner: String,
    },

    #[error("lock key must not be empty")]
    EmptyKey,
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    acquired_at: Instant,
}

/// A map of device keys to their current holder.
///
/// The inner mutex only guards the map itself and is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct ResourceLocker {
    locks: Mutex<HashMap<String, LockEntry>>,
    stale_after: Option<Duration>,
}

impl ResourceLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Break locks that have been held longer than `stale_after`.
    ///
    /// A zero interval would break every lock on contact and is ignored.
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            stale_after: (!stale_after.is_zero()).then_some(stale_after),
            ..Default::default()
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        // Nothing panics while holding this mutex, the map is always consistent
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key` for `holder` without waiting.
    pub fn acquire(&self, key: &str, holder: &str) -> Result<(), LockError> {
        if key.is_empty() {
            return Err(LockError::EmptyKey);
        }

        let mut locks = self.locks();
        if let Some(entry) = locks.get(key) {
            let stale = self
                .stale_after
                .is_some_and(|after| entry.acquired_at.elapsed() >= after);

            if entry.holder == holder {
                error!(key, holder, "re-entrant device lock acquisition");
                return Err(LockError::Reentrant {
                    key: key.into(),
                    holder: holder.into(),
                });
            }

            if !stale {
                return Err(LockError::AlreadyHeld {
                    key: key.into(),
                    holder: entry.holder.clone(),
                });
            }

            warn!(
                key,
                previous = %entry.holder,
                held_for = ?entry.acquired_at.elapsed(),
                "breaking stale device lock"
            );
        }

        locks.insert(
            key.into(),
            LockEntry {
                holder: holder.into(),
                acquired_at: Instant::now(),
            },
        );

        Ok(())
    }

    /// Give `key` back. Releasing a key nobody holds is not an error.
    pub fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        if key.is_empty() {
            return Err(LockError::EmptyKey);
        }

        let mut locks = self.locks();
        match locks.get(key) {
            None => Ok(()),
            Some(entry) if entry.holder == holder => {
                locks.remove(key);
                Ok(())
            }
            Some(entry) => {
                error!(key, holder, owner = %entry.holder, "release of a device lock held by someone else");
                Err(LockError::NotHolder {
                    key: key.into(),
                    holder: holder.into(),
                    owner: entry.holder.clone(),
                })
            }
        }
    }

    /// Claim `key` and return a guard that releases it when dropped.
    pub fn try_lock(self: &Arc<Self>, key: &str, holder: &str) -> Result<DeviceLock, LockError> {
        self.acquire(key, holder)?;

        Ok(DeviceLock {
            locker: self.clone(),
            key: key.into(),
            holder: holder.into(),
        })
    }

    /// The current holder of `key`, if any
    pub fn holder(&self, key: &str) -> Option<String> {
        self.locks().get(key).map(|e| e.holder.clone())
    }

    /// Number of device locks currently held
    pub fn held(&self) -> usize {
        self.locks().len()
    }
}

/// A claimed device. The claim ends when this is dropped, including on early
/// returns and when the owning future is cancelled.
#[derive(Debug)]
#[must_use = "the device lock is released as soon as the guard is dropped"]
pub struct DeviceLock {
    locker: Arc<ResourceLocker>,
    key: String,
    holder: String,
}

impl DeviceLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        // Misuse is already logged by release
        let _ = self.locker.release(&self.key, &self.holder);
    }
}
