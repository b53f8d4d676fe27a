//! Reference-counted pins on cache entries.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

/// Pins keys so that the eviction controller leaves them alone.
///
/// Each key carries a count of live handles referencing it; a key is locked
/// while its count is positive.
pub struct LockManager<K> {
    counts: Arc<Mutex<HashMap<K, usize>>>,
}

impl<K> Clone for LockManager<K> {
    fn clone(&self) -> Self {
        Self {
            counts: Arc::clone(&self.counts),
        }
    }
}

impl<K> Default for LockManager<K> {
    fn default() -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> LockManager<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key of the set. Keys listed twice are counted once.
    pub fn create_lock(&self, keys: impl IntoIterator<Item = K>) -> LockHandle<K> {
        let keys: Vec<K> = keys.into_iter().collect::<HashSet<K>>().into_iter().collect();
        let mut counts = self.counts.lock();
        for key in &keys {
            *counts.entry(key.clone()).or_insert(0) += 1;
        }
        LockHandle {
            keys,
            counts: Arc::clone(&self.counts),
            released: false,
        }
    }

    #[must_use]
    pub fn is_locked(&self, key: &K) -> bool {
        self.counts.lock().get(key).is_some_and(|count| *count > 0)
    }

    /// Number of distinct locked keys
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.counts.lock().len()
    }
}

/// Lock on a set of keys, released explicitly or on drop
pub struct LockHandle<K: Eq + Hash> {
    keys: Vec<K>,
    counts: Arc<Mutex<HashMap<K, usize>>>,
    released: bool,
}

impl<K: Eq + Hash> LockHandle<K> {
    /// Release the lock. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut counts = self.counts.lock();
        for key in &self.keys {
            if let Some(count) = counts.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(key);
                }
            }
        }
    }

    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }
}

impl<K: Eq + Hash> Drop for LockHandle<K> {
    fn drop(&mut self) {
        self.release();
    }
}
