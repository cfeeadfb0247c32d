// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Named mutex built on [`Store::set_nx`], usable across the worker
//! processes that share one store.
//!
//! The lock value is `"<token>|<deadline-ms>"`: a holder that dies without
//! releasing only blocks others until its lease runs out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::{Store, StoreError, StoreResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_LEASE: Duration = Duration::from_secs(600);

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A named, lease-based mutex living in the store.
pub struct StoreMutex<'a> {
    store: &'a dyn Store,
    key: String,
    lease: Duration,
}

impl<'a> StoreMutex<'a> {
    /// Mutex named `name`; its store key is `mutex:<name>:init`.
    #[must_use]
    pub fn new(store: &'a dyn Store, name: &str) -> Self {
        Self {
            store,
            key: format!("mutex:{name}:init"),
            lease: DEFAULT_LEASE,
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until the lock is ours, then return a guard that releases it
    /// on drop.
    pub fn acquire(&self) -> StoreResult<MutexGuard<'a>> {
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// One acquisition attempt. `None` means someone else holds a live lease.
    pub fn try_acquire(&self) -> StoreResult<Option<MutexGuard<'a>>> {
        let token = format!(
            "{}-{}",
            std::process::id(),
            TOKEN_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let value = format!("{token}|{}", now_ms() + self.lease.as_millis() as u64);
        if self.store.set_nx(&self.key, &value)? {
            debug!("acquired {}", self.key);
            return Ok(Some(MutexGuard {
                store: self.store,
                key: self.key.clone(),
                token,
                released: false,
            }));
        }
        // holder present; break a stale lease and retry on the next call
        if let Some(held) = self.store.get(&self.key)? {
            if lease_expired(&held) {
                warn!("breaking expired lease on {}", self.key);
                self.store.del(&self.key)?;
            }
        }
        Ok(None)
    }

    /// Whether some holder currently has a live lease.
    pub fn is_locked(&self) -> StoreResult<bool> {
        match self.store.get(&self.key)? {
            None => Ok(false),
            Some(held) => Ok(!lease_expired(&held)),
        }
    }

    /// Block until the mutex is free. Does not acquire it.
    pub fn wait(&self) -> StoreResult<()> {
        while self.is_locked()? {
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

fn lease_expired(value: &str) -> bool {
    value
        .rsplit_once('|')
        .and_then(|(_, deadline)| deadline.parse::<u64>().ok())
        .is_some_and(|deadline| deadline < now_ms())
}

/// Holds the named mutex; dropping it releases the lock if we still own it.
pub struct MutexGuard<'a> {
    store: &'a dyn Store,
    key: String,
    token: String,
    released: bool,
}

impl MutexGuard<'_> {
    /// Release explicitly, surfacing backend errors that `drop` would hide.
    pub fn release(mut self) -> StoreResult<()> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> StoreResult<()> {
        // compare-and-delete: never clobber a lock someone re-acquired
        // after our lease expired
        match self.store.get(&self.key)? {
            Some(held) if held.split_once('|').is_some_and(|(t, _)| t == self.token) => {
                self.store.del(&self.key)?;
                debug!("released {}", self.key);
                Ok(())
            }
            Some(_) => Err(StoreError::Backend(format!(
                "lock {} stolen before release",
                self.key
            ))),
            None => Ok(()),
        }
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release_inner() {
                warn!("failed to release {}: {e}", self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    #[test]
    fn acquire_release_cycle() {
        let store = MemStore::new();
        let mutex = StoreMutex::new(&store, "popjoin");
        assert!(!mutex.is_locked().unwrap());
        let guard = mutex.acquire().unwrap();
        assert!(mutex.is_locked().unwrap());
        assert!(mutex.try_acquire().unwrap().is_none());
        guard.release().unwrap();
        assert!(!mutex.is_locked().unwrap());
    }

    #[test]
    fn drop_releases() {
        let store = MemStore::new();
        let mutex = StoreMutex::new(&store, "popjoin");
        {
            let _guard = mutex.acquire().unwrap();
            assert!(mutex.is_locked().unwrap());
        }
        assert!(!mutex.is_locked().unwrap());
    }

    #[test]
    fn expired_lease_can_be_broken() {
        let store = MemStore::new();
        let mutex = StoreMutex::new(&store, "popjoin").with_lease(Duration::from_millis(1));
        let guard = mutex.acquire().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!mutex.is_locked().unwrap());
        let second = StoreMutex::new(&store, "popjoin");
        let guard2 = second.acquire().unwrap();
        drop(guard2);
        // the original guard must not clobber the lock it lost
        drop(guard);
    }

    #[test]
    fn wait_blocks_until_free() {
        let store = MemStore::new();
        std::thread::scope(|scope| {
            let mutex = StoreMutex::new(&store, "popjoin");
            let guard = mutex.acquire().unwrap();
            let waiter = scope.spawn(|| {
                let m = StoreMutex::new(&store, "popjoin");
                m.wait().unwrap();
                true
            });
            std::thread::sleep(Duration::from_millis(20));
            guard.release().unwrap();
            assert!(waiter.join().unwrap());
        });
    }
}
