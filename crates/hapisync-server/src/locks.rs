//! Keyed async locks.
//!
//! One mutex per key (user id or connection id) so different users sync in
//! parallel while work on the same key is serialised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A map of lazily created per-key mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Unused slots are dropped so the map stays bounded by active keys.
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits for the lock on `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Takes the lock on `key` if it is free.
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Whether someone currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(key).is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.try_lock("u-1").unwrap();
        assert!(locks.try_lock("u-1").is_none());
        assert!(locks.is_locked("u-1"));
        assert!(locks.try_lock("u-2").is_some());

        drop(guard);
        assert!(!locks.is_locked("u-1"));
        assert!(locks.try_lock("u-1").is_some());
    }

    #[tokio::test]
    async fn waiters_get_the_lock_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("c-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("c-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn idle_slots_are_pruned() {
        let locks = KeyedLocks::new();
        for i in 0..10 {
            drop(locks.lock(&format!("k-{i}")).await);
        }
        let _held = locks.lock("held").await;
        drop(locks.lock("other").await);
        let len = locks.locks.lock().unwrap().len();
        assert!(len <= 2, "slots left: {len}");
    }
}
