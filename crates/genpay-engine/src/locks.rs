//! Per-key async mutexes.
//!
//! Every read-modify-write in the engine runs inside the critical section of
//! the key it touches. Tasks are locked before accounts, never the reverse.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use genpay_core::{TaskId, UserId};

/// A map of lazily created mutexes, one per key.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// The two lock maps shared by every engine component.
#[derive(Debug, Default)]
pub struct Locks {
    /// Locks keyed by task.
    pub tasks: KeyedLocks<TaskId>,
    /// Locks keyed by account.
    pub accounts: KeyedLocks<UserId>,
}

impl Locks {
    /// Create empty lock maps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock two accounts in a fixed order.
    ///
    /// Returns a single guard when both ids are the same.
    pub async fn lock_account_pair(
        &self,
        a: UserId,
        b: UserId,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.accounts.lock(&a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.accounts.lock(&first).await;
        let second = self.accounts.lock(&second).await;
        (first, Some(second))
    }

    /// Drop idle entries from both maps.
    pub fn prune(&self) -> usize {
        self.tasks.prune() + self.accounts.prune()
    }
}
