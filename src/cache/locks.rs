//! Per-repository mutual exclusion.
//!
//! Each key gets its own async mutex, created on first use and dropped
//! from the map as soon as nobody holds or waits for it.  Unrelated keys
//! never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type Slots = DashMap<String, Arc<Mutex<()>>>;

/// A map of independently lockable keys.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Slots>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel-safe: dropping the returned future while it waits releases
    /// its claim on the slot.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = Arc::clone(self.slots.entry(key.to_owned()).or_default().value());
        let slot = SlotRef {
            key: key.to_owned(),
            slots: Arc::clone(&self.slots),
            mutex: Some(Arc::clone(&mutex)),
        };
        let guard = mutex.lock_owned().await;
        trace!(%key, "key lock acquired");
        KeyGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// Number of keys currently held or awaited.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard {
    // Field order matters: the mutex guard must be released before the
    // slot reference tries to prune the map entry.
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef,
}

struct SlotRef {
    key: String,
    slots: Arc<Slots>,
    mutex: Option<Arc<Mutex<()>>>,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        drop(self.mutex.take());
        // Only the map's own reference left: nobody holds or awaits the key.
        self.slots
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("alice/repo1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("alice/repo1").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock("bob/repo1")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock("alice/repo1").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_a_slot() {
        let locks = KeyedLocks::new();
        let holder = locks.lock("alice/repo1").await;

        let waited =
            tokio::time::timeout(Duration::from_millis(20), locks.lock("alice/repo1")).await;
        assert!(waited.is_err());

        drop(holder);
        assert!(locks.is_empty());
    }
}
