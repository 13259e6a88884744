//! Expiring in-memory store for mid-flow payloads.
//!
//! Some flows collect data that must not go into the durable token (an
//! uploaded voice sample, a chat history) before a later step uses it. That
//! data lives here, keyed by account, and is lost on restart. A later step
//! that finds nothing gets [`ScratchError::Expired`] and asks the user to
//! start over.
//!
//! # Memory bounds
//!
//! - Entries expire after a fixed TTL.
//! - Expired entries are swept every [`CLEANUP_INTERVAL`] inserts.
//! - The number of accounts holding an entry never exceeds `max_entries`.
//!   When full, a sweep is forced; if the store is still full the insert is
//!   refused with [`ScratchError::Full`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use super::error::ScratchError;
use crate::config::SessionConfig;
use crate::ledger::AccountId;

/// Inserts between periodic sweeps.
pub const CLEANUP_INTERVAL: u64 = 100;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// Per-account expiring payloads.
#[derive(Debug)]
pub struct ScratchStore<T> {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<AccountId, Entry<T>>>,
    inserts: AtomicU64,
}

impl<T> ScratchStore<T> {
    /// Creates a store with the given TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: RwLock::new(HashMap::new()),
            inserts: AtomicU64::new(0),
        }
    }

    /// Creates a store from configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.scratch_ttl(), config.scratch_max_entries)
    }

    /// Stores `value` for `account`, replacing any previous payload.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError::Full`] if the account holds no entry and the
    /// store is at capacity after a sweep.
    pub fn put(&self, account: AccountId, value: T) -> Result<(), ScratchError> {
        let count = self.inserts.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % CLEANUP_INTERVAL == 0 {
            self.cleanup();
        }

        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !entries.contains_key(&account) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                debug!(max_entries = self.max_entries, "scratch store full");
                return Err(ScratchError::Full {
                    max_entries: self.max_entries,
                });
            }
        }

        entries.insert(
            account,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    /// Removes and returns the payload for `account`.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError::Expired`] if there is no live payload.
    pub fn take(&self, account: AccountId) -> Result<T, ScratchError> {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&account);
        match entry {
            Some(e) if e.expires_at > Instant::now() => Ok(e.value),
            _ => Err(ScratchError::Expired),
        }
    }

    /// Discards the payload for `account`, if any.
    pub fn remove(&self, account: AccountId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&account);
    }

    /// Drops every expired entry.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept expired scratch entries");
        }
    }

    /// Returns the number of stored entries, including expired ones not yet
    /// swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> ScratchStore<T> {
    /// Returns a copy of the live payload for `account` without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`ScratchError::Expired`] if there is no live payload.
    pub fn get(&self, account: AccountId) -> Result<T, ScratchError> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match entries.get(&account) {
            Some(e) if e.expires_at > Instant::now() => Ok(e.value.clone()),
            _ => Err(ScratchError::Expired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_take() {
        let store = ScratchStore::new(Duration::from_secs(60), 10);
        let id = AccountId::new(1);

        store.put(id, vec![1u8, 2, 3]).unwrap();
        assert_eq!(store.get(id).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.take(id).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.take(id), Err(ScratchError::Expired));
    }

    #[test]
    fn test_missing_after_restart_is_expired() {
        let fresh: ScratchStore<String> = ScratchStore::new(Duration::from_secs(60), 10);
        assert_eq!(fresh.take(AccountId::new(9)), Err(ScratchError::Expired));
    }

    #[test]
    fn test_expired_entry_is_not_returned() {
        let store = ScratchStore::new(Duration::ZERO, 10);
        let id = AccountId::new(1);
        store.put(id, "sample").unwrap();
        assert_eq!(store.get(id), Err(ScratchError::Expired));
        assert_eq!(store.take(id), Err(ScratchError::Expired));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let store = ScratchStore::new(Duration::from_secs(60), 2);
        store.put(AccountId::new(1), 1).unwrap();
        store.put(AccountId::new(2), 2).unwrap();

        // Replacing an existing entry is always allowed.
        store.put(AccountId::new(2), 3).unwrap();

        assert_eq!(
            store.put(AccountId::new(3), 4),
            Err(ScratchError::Full { max_entries: 2 })
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_full_store_evicts_expired_entries() {
        let store = ScratchStore::new(Duration::ZERO, 1);
        store.put(AccountId::new(1), 1).unwrap();
        // The first entry is already expired, so a new account fits.
        store.put(AccountId::new(2), 2).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cleanup_sweeps_expired() {
        let store = ScratchStore::new(Duration::ZERO, 10);
        store.put(AccountId::new(1), ()).unwrap();
        store.put(AccountId::new(2), ()).unwrap();
        store.cleanup();
        assert!(store.is_empty());
    }
}
