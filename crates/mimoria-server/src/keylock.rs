//! Keyed async lock table (§4.B).
//!
//! Guarantees at most one task at a time holds the logical lock for a given
//! key, while keeping the table size proportional to currently-contended
//! keys rather than to cache size: a slot is created on first acquisition
//! and removed once its waiter count returns to zero.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<Mutex<()>>,
    waiters: AtomicU32,
}

/// Table of per-key locks, shared across connection/replication tasks via
/// `Arc<KeyLockTable>`.
pub struct KeyLockTable {
    slots: DashMap<Vec<u8>, Arc<Slot>>,
}

/// Holds a key's lock until dropped. A `take=false` releaser is a no-op:
/// the caller already holds the lock externally (the replication-apply
/// path, per §4.B's contract).
pub struct Releaser {
    key: Vec<u8>,
    table: Option<Arc<KeyLockTable>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub async fn acquire(self: &Arc<Self>, key: &[u8], take: bool) -> Releaser {
        if !take {
            return Releaser {
                key: key.to_vec(),
                table: None,
                guard: None,
            };
        }

        let mutex = {
            let slot = self.slots.entry(key.to_vec()).or_insert_with(|| {
                Arc::new(Slot {
                    mutex: Arc::new(Mutex::new(())),
                    waiters: AtomicU32::new(0),
                })
            });
            slot.waiters.fetch_add(1, Ordering::SeqCst);
            slot.mutex.clone()
        };

        let guard = mutex.lock_owned().await;

        Releaser {
            key: key.to_vec(),
            table: Some(self.clone()),
            guard: Some(guard),
        }
    }

    /// Current number of contended keys (slots present). Proportional to
    /// contention, not to cache size — used by tests to assert cleanup.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, key: &[u8]) {
        let mut should_try_remove = false;
        if let Some(slot) = self.slots.get(key) {
            let remaining = slot.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
            should_try_remove = remaining == 0;
        }
        if should_try_remove {
            self.slots
                .remove_if(key, |_, slot| slot.waiters.load(Ordering::SeqCst) == 0);
        }
    }
}

impl Default for KeyLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        // Release the primitive first, then shrink the table (§4.B Release).
        self.guard.take();
        if let Some(table) = self.table.take() {
            table.release(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[tokio::test]
    async fn table_is_empty_after_release() {
        let table = Arc::new(KeyLockTable::new());
        {
            let _g = table.acquire(b"k", true).await;
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn take_false_returns_immediately_without_touching_table() {
        let table = Arc::new(KeyLockTable::new());
        let _g = table.acquire(b"k", false).await;
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_acquisitions_are_mutually_exclusive() {
        let table = Arc::new(KeyLockTable::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let table = table.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _g = table.acquire(b"shared", true).await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                // If exclusion ever failed, another task would have
                // incremented counter between our read and our check.
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_keys_do_not_contend() {
        let table = Arc::new(KeyLockTable::new());
        let a = table.acquire(b"a", true).await;
        let b = table.acquire(b"b", true).await;
        assert_eq!(table.len(), 2);
        drop(a);
        drop(b);
        assert!(table.is_empty());
    }
}
