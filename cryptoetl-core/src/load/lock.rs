//! In-process per-series mutual exclusion.
//!
//! Every loader built from one run shares a `KeyLocks`; a load holds its key's
//! guard from snapshot through commit. Different keys never block each other.

use crate::domain::SeriesKey;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Table {
    held: Mutex<HashSet<SeriesKey>>,
    released: Condvar,
}

impl Table {
    fn lock(&self) -> MutexGuard<'_, HashSet<SeriesKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    table: Arc<Table>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn acquire(&self, key: SeriesKey) -> KeyGuard {
        let mut held = self.table.lock();
        while held.contains(&key) {
            tracing::debug!(key = %key, "waiting for key lock");
            held = self
                .table
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key);
        KeyGuard {
            table: Arc::clone(&self.table),
            key,
        }
    }

    pub fn is_held(&self, key: SeriesKey) -> bool {
        self.table.lock().contains(&key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct KeyGuard {
    table: Arc<Table>,
    key: SeriesKey,
}

impl KeyGuard {
    pub fn key(&self) -> SeriesKey {
        self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, IntervalKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn btc() -> SeriesKey {
        SeriesKey::new(Asset::Btc, IntervalKind::Daily)
    }

    #[test]
    fn same_key_is_exclusive_other_keys_are_not() {
        let locks = KeyLocks::new();
        let guard = locks.acquire(btc());
        assert!(locks.is_held(btc()));
        let hourly = locks.acquire(SeriesKey::new(Asset::Btc, IntervalKind::Hourly));
        assert_eq!(hourly.key().interval, IntervalKind::Hourly);
        drop(guard);
        assert!(!locks.is_held(btc()));
        assert!(locks.is_held(hourly.key()));
    }

    #[test]
    fn waiters_are_serialized() {
        let locks = KeyLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = locks.acquire(btc());
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
