//! Weighted LRU bookkeeping with reservations and background eviction.
//!
//! Entries are either reserved (space accounted, content not there yet) or
//! cached (ordered by last access). Once usage passes the eviction
//! threshold, a background pass evicts the least recently used entries the
//! eviction judge allows, until usage is back at the safe threshold.

use super::executor::EvictionExecutor;
use crate::alert::{AlertLevel, AlertService};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tapeio_common::{Error, Result};
use tracing::{debug, error, info, warn};

/// Decides whether an entry may be evicted during one eviction pass
pub trait EvictionJudge<K>: Send {
    fn can_evict_entry(&self, key: &K) -> bool;
}

impl<K, F> EvictionJudge<K> for F
where
    F: Fn(&K) -> bool + Send,
{
    fn can_evict_entry(&self, key: &K) -> bool {
        self(key)
    }
}

/// Builds a fresh judge at the start of every eviction pass
pub type EvictionJudgeFactory<K> =
    Arc<dyn Fn() -> Result<Box<dyn EvictionJudge<K>>> + Send + Sync>;

/// Called for every evicted key once the cache state is unlocked
pub type EvictionListener<K> = Box<dyn Fn(&K) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LruCacheEntry<K> {
    pub key: K,
    pub weight: u64,
    pub last_access: DateTime<Utc>,
}

impl<K> LruCacheEntry<K> {
    pub const fn new(key: K, weight: u64, last_access: DateTime<Utc>) -> Self {
        Self {
            key,
            weight,
            last_access,
        }
    }
}

type QueuePosition = (DateTime<Utc>, u64);

struct LruState<K> {
    /// Cached entries by (last access, insertion sequence)
    queue: BTreeMap<QueuePosition, K>,
    positions: HashMap<K, QueuePosition>,
    /// Entries confirmed while an eviction pass runs
    pending: HashMap<K, LruCacheEntry<K>>,
    reserved: HashMap<K, LruCacheEntry<K>>,
    /// Weight of every cached entry, queued or pending
    weights: HashMap<K, u64>,
    /// Evicted keys whose listener has not returned yet
    evicting: HashSet<K>,
    current_capacity: u64,
    eviction_running: bool,
    next_sequence: u64,
}

impl<K: Clone + Eq + Hash> LruState<K> {
    fn enqueue(&mut self, key: K, last_access: DateTime<Utc>) {
        let position = (last_access, self.next_sequence);
        self.next_sequence += 1;
        if let Some(previous) = self.positions.insert(key.clone(), position) {
            self.queue.remove(&previous);
        }
        self.queue.insert(position, key);
    }

    fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key) || self.pending.contains_key(key)
    }
}

struct LruInner<K> {
    max_capacity: u64,
    eviction_capacity: u64,
    safe_capacity: u64,
    judge_factory: EvictionJudgeFactory<K>,
    listener: EvictionListener<K>,
    executor: Arc<dyn EvictionExecutor>,
    alert_service: Arc<dyn AlertService>,
    state: Mutex<LruState<K>>,
}

/// Thread-safe weighted LRU cache index
pub struct LruCache<K> {
    inner: Arc<LruInner<K>>,
}

impl<K> Clone for LruCache<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> LruCache<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Build the cache from entries already present. Requires
    /// `max_capacity > eviction_capacity > safe_capacity > 0`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_capacity: u64,
        eviction_capacity: u64,
        safe_capacity: u64,
        judge_factory: EvictionJudgeFactory<K>,
        listener: EvictionListener<K>,
        initial_entries: impl IntoIterator<Item = LruCacheEntry<K>>,
        executor: Arc<dyn EvictionExecutor>,
        alert_service: Arc<dyn AlertService>,
    ) -> Result<Self> {
        if safe_capacity == 0 {
            return Err(Error::invalid_argument("safe capacity must be positive"));
        }
        if eviction_capacity <= safe_capacity {
            return Err(Error::invalid_argument(
                "eviction capacity must be greater than safe capacity",
            ));
        }
        if max_capacity <= eviction_capacity {
            return Err(Error::invalid_argument(
                "max capacity must be greater than eviction capacity",
            ));
        }

        let mut state = LruState {
            queue: BTreeMap::new(),
            positions: HashMap::new(),
            pending: HashMap::new(),
            reserved: HashMap::new(),
            weights: HashMap::new(),
            evicting: HashSet::new(),
            current_capacity: 0,
            eviction_running: false,
            next_sequence: 0,
        };
        for entry in initial_entries {
            if state.contains(&entry.key) {
                return Err(Error::invalid_argument(format!("duplicate key {}", entry.key)));
            }
            debug!(
                "Added entry {} with weight {} during initialization",
                entry.key, entry.weight
            );
            state.weights.insert(entry.key.clone(), entry.weight);
            state.current_capacity += entry.weight;
            state.enqueue(entry.key, entry.last_access);
        }

        let cache = Self {
            inner: Arc::new(LruInner {
                max_capacity,
                eviction_capacity,
                safe_capacity,
                judge_factory,
                listener,
                executor,
                alert_service,
                state: Mutex::new(state),
            }),
        };
        let start = cache.inner.mark_eviction_if_needed(&mut cache.inner.state.lock());
        if start {
            cache.schedule_eviction();
        }
        Ok(cache)
    }

    /// Account for an entry whose content is about to be written.
    ///
    /// Fails if the key is known, or if the entry does not fit below the
    /// max capacity, in which case an alert is raised.
    pub fn reserve_entry(&self, entry: LruCacheEntry<K>) -> Result<()> {
        let start = {
            let mut state = self.inner.state.lock();
            if state.contains(&entry.key) || state.reserved.contains_key(&entry.key) {
                return Err(Error::invalid_argument(format!(
                    "entry {} already exists in the cache",
                    entry.key
                )));
            }
            if state.evicting.contains(&entry.key) {
                return Err(Error::invalid_argument(format!(
                    "entry {} is being evicted",
                    entry.key
                )));
            }
            if state.current_capacity + entry.weight > self.inner.max_capacity {
                let message = format!(
                    "Cannot add entry {}. Cache capacity exceeded. Max capacity: {}. \
                     Eviction capacity: {}. Safe capacity: {}. Current capacity: {}. \
                     Entry capacity to reserve: {}",
                    entry.key,
                    self.inner.max_capacity,
                    self.inner.eviction_capacity,
                    self.inner.safe_capacity,
                    state.current_capacity,
                    entry.weight
                );
                self.inner
                    .alert_service
                    .create_alert(AlertLevel::Error, &message);
                return Err(Error::CapacityExceeded {
                    required: entry.weight,
                    usage: state.current_capacity,
                    max: self.inner.max_capacity,
                });
            }
            state.current_capacity += entry.weight;
            state.reserved.insert(entry.key.clone(), entry);
            self.inner.mark_eviction_if_needed(&mut state)
        };
        if start {
            self.schedule_eviction();
        }
        Ok(())
    }

    /// Turn a reservation into a cached entry
    pub fn confirm_reservation(&self, key: &K) -> Result<()> {
        let mut state = self.inner.state.lock();
        let entry = state.reserved.remove(key).ok_or_else(|| {
            Error::invalid_argument(format!(
                "no active reservation for entry {key}. Already confirmed or canceled?"
            ))
        })?;
        state.weights.insert(entry.key.clone(), entry.weight);
        if state.eviction_running {
            // The running pass judges a snapshot; new entries join after it
            state.pending.insert(entry.key.clone(), entry);
        } else {
            state.enqueue(entry.key, entry.last_access);
        }
        Ok(())
    }

    /// Drop a reservation and give its space back
    pub fn cancel_reservation(&self, key: &K) -> Result<()> {
        let mut state = self.inner.state.lock();
        let entry = state.reserved.remove(key).ok_or_else(|| {
            Error::invalid_argument(format!(
                "no active reservation for entry {key}. Already confirmed or canceled?"
            ))
        })?;
        state.current_capacity -= entry.weight;
        Ok(())
    }

    /// Refresh the last access time of a reserved or cached entry. Returns
    /// false for unknown keys.
    pub fn update_entry_access_timestamp(&self, key: &K, last_access: DateTime<Utc>) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.reserved.get_mut(key) {
            entry.last_access = last_access;
            return true;
        }
        if let Some(entry) = state.pending.get_mut(key) {
            entry.last_access = last_access;
            return true;
        }
        if state.positions.contains_key(key) {
            state.enqueue(key.clone(), last_access);
            return true;
        }
        debug!("Entry {} not found in cache. Concurrent eviction?", key);
        false
    }

    /// Whether the entry is cached (reservations excluded)
    #[must_use]
    pub fn contains_entry(&self, key: &K) -> bool {
        self.inner.state.lock().contains(key)
    }

    #[must_use]
    pub fn is_reserved_entry(&self, key: &K) -> bool {
        self.inner.state.lock().reserved.contains_key(key)
    }

    #[must_use]
    pub fn reserved_entry(&self, key: &K) -> Option<LruCacheEntry<K>> {
        self.inner.state.lock().reserved.get(key).cloned()
    }

    #[must_use]
    pub fn max_capacity(&self) -> u64 {
        self.inner.max_capacity
    }

    #[must_use]
    pub fn eviction_capacity(&self) -> u64 {
        self.inner.eviction_capacity
    }

    #[must_use]
    pub fn safe_capacity(&self) -> u64 {
        self.inner.safe_capacity
    }

    #[must_use]
    pub fn current_capacity(&self) -> u64 {
        self.inner.state.lock().current_capacity
    }

    #[must_use]
    pub fn is_eviction_running(&self) -> bool {
        self.inner.state.lock().eviction_running
    }

    fn schedule_eviction(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .execute(Box::new(move || inner.run_eviction()));
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.inner.state.lock();
        let reserved: u64 = state.reserved.values().map(|e| e.weight).sum();
        let cached: u64 = state.weights.values().sum();
        assert_eq!(reserved + cached, state.current_capacity);
        assert!(state.current_capacity <= self.inner.max_capacity);
        assert_eq!(state.queue.len(), state.positions.len());
        assert_eq!(state.positions.len() + state.pending.len(), state.weights.len());
    }
}

impl<K> LruInner<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    /// Flag a new eviction pass if usage is past the eviction threshold and
    /// none is running. The caller schedules it once the lock is released.
    fn mark_eviction_if_needed(&self, state: &mut LruState<K>) -> bool {
        if state.current_capacity > self.eviction_capacity && !state.eviction_running {
            state.eviction_running = true;
            info!(
                "Cache capacity exceeded. Background eviction process started. Max capacity: {}. \
                 Eviction capacity: {}. Safe capacity: {}. Current capacity: {}",
                self.max_capacity,
                self.eviction_capacity,
                self.safe_capacity,
                state.current_capacity
            );
            return true;
        }
        false
    }

    fn run_eviction(&self) {
        // Building the judge may query the metadata store: do it unlocked
        match (self.judge_factory)() {
            Ok(judge) => self.evict_old_entries(judge.as_ref()),
            Err(e) => {
                error!("Cache eviction process failed: {}", e);
                self.alert_service.create_alert(
                    AlertLevel::Error,
                    &format!("Cache eviction process failed: {e}"),
                );
            }
        }
        self.finalize_eviction();
    }

    fn evict_old_entries(&self, judge: &dyn EvictionJudge<K>) {
        let (evicted, current_capacity) = self.select_evicted_entries(judge);

        // Listeners touch the filesystem: run them unlocked
        for key in &evicted {
            (self.listener)(key);
        }
        if !evicted.is_empty() {
            let mut state = self.state.lock();
            for key in &evicted {
                state.evicting.remove(key);
            }
        }

        if current_capacity <= self.safe_capacity {
            info!(
                "Enough space freed. Current capacity: {}. Safe capacity: {}",
                current_capacity, self.safe_capacity
            );
            return;
        }
        let message = format!(
            "Critical cache level. Max capacity: {}. Eviction capacity: {}. Safe capacity: {}. \
             Current capacity: {}",
            self.max_capacity, self.eviction_capacity, self.safe_capacity, current_capacity
        );
        warn!("{}", message);
        self.alert_service.create_alert(AlertLevel::Warn, &message);
    }

    /// Remove the least recently used evictable entries from the state
    /// tables. Returns their keys and the capacity left afterwards.
    fn select_evicted_entries(&self, judge: &dyn EvictionJudge<K>) -> (Vec<K>, u64) {
        let mut state = self.state.lock();
        info!(
            "Trying to free some disk space. Max capacity: {}. Eviction capacity: {}. \
             Safe capacity: {}. Current capacity: {}",
            self.max_capacity, self.eviction_capacity, self.safe_capacity, state.current_capacity
        );

        let candidates: Vec<(QueuePosition, K)> = state
            .queue
            .iter()
            .map(|(position, key)| (*position, key.clone()))
            .collect();
        let mut evicted = Vec::new();
        for (position, key) in candidates {
            if state.current_capacity <= self.safe_capacity {
                break;
            }
            if !judge.can_evict_entry(&key) {
                debug!("Entry {} is old but cannot be evicted", key);
                continue;
            }
            state.queue.remove(&position);
            state.positions.remove(&key);
            let weight = state.weights.remove(&key).unwrap_or(0);
            state.current_capacity -= weight;
            state.evicting.insert(key.clone());
            info!("Evicting entry {}", key);
            evicted.push(key);
        }
        (evicted, state.current_capacity)
    }

    fn finalize_eviction(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for (key, entry) in pending {
            state.enqueue(key, entry.last_access);
        }
        state.eviction_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::tests::RecordingAlertService;
    use crate::cache::executor::tests::ManualExecutor;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;

    struct Fixture {
        cache: LruCache<String>,
        executor: Arc<ManualExecutor>,
        alerts: Arc<RecordingAlertService>,
        evicted: Arc<Mutex<Vec<String>>>,
        protected: Arc<Mutex<HashSet<String>>>,
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn entry(key: &str, weight: u64, minutes: i64) -> LruCacheEntry<String> {
        LruCacheEntry::new(key.to_string(), weight, at(minutes))
    }

    fn fixture(initial: Vec<LruCacheEntry<String>>) -> Fixture {
        let executor = Arc::new(ManualExecutor::default());
        let alerts = Arc::new(RecordingAlertService::default());
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let protected = Arc::new(Mutex::new(HashSet::new()));
        let judge_protected = Arc::clone(&protected);
        let listener_evicted = Arc::clone(&evicted);
        let cache = LruCache::new(
            1000,
            800,
            600,
            Arc::new(move || {
                let protected = judge_protected.lock().clone();
                Ok(Box::new(move |key: &String| !protected.contains(key))
                    as Box<dyn EvictionJudge<String>>)
            }),
            Box::new(move |key: &String| listener_evicted.lock().push(key.clone())),
            initial,
            Arc::clone(&executor) as Arc<dyn EvictionExecutor>,
            Arc::clone(&alerts) as Arc<dyn AlertService>,
        )
        .unwrap();
        Fixture {
            cache,
            executor,
            alerts,
            evicted,
            protected,
        }
    }

    #[test]
    fn test_invalid_capacities() {
        let build = |max, eviction, safe| {
            LruCache::<String>::new(
                max,
                eviction,
                safe,
                Arc::new(|| Ok(Box::new(|_: &String| true) as Box<dyn EvictionJudge<String>>)),
                Box::new(|_: &String| {}),
                Vec::new(),
                Arc::new(ManualExecutor::default()),
                Arc::new(RecordingAlertService::default()),
            )
        };
        assert!(build(1000, 800, 0).is_err());
        assert!(build(1000, 600, 600).is_err());
        assert!(build(800, 800, 600).is_err());
        assert!(build(1000, 800, 600).is_ok());
    }

    #[test]
    fn test_reserve_confirm_cancel() {
        let f = fixture(vec![entry("a", 100, 0)]);
        assert_eq!(f.cache.current_capacity(), 100);
        assert!(f.cache.contains_entry(&"a".to_string()));

        f.cache.reserve_entry(entry("b", 200, 1)).unwrap();
        assert!(f.cache.is_reserved_entry(&"b".to_string()));
        assert!(!f.cache.contains_entry(&"b".to_string()));
        assert_eq!(f.cache.current_capacity(), 300);

        f.cache.confirm_reservation(&"b".to_string()).unwrap();
        assert!(f.cache.contains_entry(&"b".to_string()));
        assert!(f.cache.confirm_reservation(&"b".to_string()).is_err());

        f.cache.reserve_entry(entry("c", 50, 2)).unwrap();
        f.cache.cancel_reservation(&"c".to_string()).unwrap();
        assert!(f.cache.cancel_reservation(&"c".to_string()).is_err());
        assert_eq!(f.cache.current_capacity(), 300);
        f.cache.assert_consistent();
    }

    #[test]
    fn test_duplicates_rejected() {
        let f = fixture(vec![entry("a", 100, 0)]);
        assert!(f.cache.reserve_entry(entry("a", 10, 1)).is_err());
        f.cache.reserve_entry(entry("b", 10, 1)).unwrap();
        assert!(f.cache.reserve_entry(entry("b", 10, 1)).is_err());

        let dup = LruCache::new(
            1000,
            800,
            600,
            Arc::new(|| Ok(Box::new(|_: &String| true) as Box<dyn EvictionJudge<String>>)),
            Box::new(|_: &String| {}),
            vec![entry("a", 1, 0), entry("a", 1, 0)],
            Arc::new(ManualExecutor::default()),
            Arc::new(RecordingAlertService::default()),
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_eviction_threshold_boundary() {
        let f = fixture(vec![entry("a", 400, 0)]);
        // Exactly at the eviction threshold
        f.cache.reserve_entry(entry("b", 400, 1)).unwrap();
        assert_eq!(f.executor.pending(), 0);
        assert!(!f.cache.is_eviction_running());

        // One byte more
        f.cache.reserve_entry(entry("c", 1, 2)).unwrap();
        assert_eq!(f.executor.pending(), 1);
        assert!(f.cache.is_eviction_running());

        // No second pass while one is in flight
        f.cache.reserve_entry(entry("d", 1, 3)).unwrap();
        assert_eq!(f.executor.pending(), 1);
        f.cache.assert_consistent();
    }

    #[test]
    fn test_capacity_exceeded_raises_one_alert() {
        let f = fixture(vec![entry("a", 500, 0)]);
        f.cache.reserve_entry(entry("b", 500, 1)).unwrap();
        assert_eq!(f.cache.current_capacity(), 1000);

        let err = f.cache.reserve_entry(entry("c", 1, 2)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        let alerts = f.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertLevel::Error);
        assert!(!f.cache.is_reserved_entry(&"c".to_string()));
        f.cache.assert_consistent();
    }

    #[test]
    fn test_eviction_order_and_protection() {
        let f = fixture(vec![
            entry("oldest", 200, 0),
            entry("protected", 200, 1),
            entry("middle", 200, 2),
            entry("recent", 200, 3),
        ]);
        f.protected.lock().insert("protected".to_string());
        // Refresh "oldest" so "middle" becomes the least recently used
        assert!(f.cache.update_entry_access_timestamp(&"oldest".to_string(), at(10)));

        f.cache.reserve_entry(entry("new", 100, 11)).unwrap();
        assert_eq!(f.executor.run_all(), 1);

        // 900: skip protected, evict middle (700) then recent (500)
        assert_eq!(*f.evicted.lock(), vec!["middle".to_string(), "recent".to_string()]);
        assert_eq!(f.cache.current_capacity(), 500);
        assert!(f.cache.contains_entry(&"protected".to_string()));
        assert!(f.cache.contains_entry(&"oldest".to_string()));
        assert!(f.cache.is_reserved_entry(&"new".to_string()));
        assert!(f.alerts.alerts().is_empty());
        assert!(!f.cache.is_eviction_running());
        f.cache.assert_consistent();
    }

    #[test]
    fn test_critical_level_alert_when_nothing_evictable() {
        let f = fixture(vec![entry("a", 450, 0), entry("b", 400, 1)]);
        f.protected.lock().extend(["a".to_string(), "b".to_string()]);
        // Initial usage above the eviction threshold schedules a pass
        assert_eq!(f.executor.run_all(), 1);
        assert!(f.evicted.lock().is_empty());
        let alerts = f.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertLevel::Warn);
        assert!(alerts[0].1.starts_with("Critical cache level"));
    }

    #[test]
    fn test_failed_judge_raises_error_alert() {
        let executor = Arc::new(ManualExecutor::default());
        let alerts = Arc::new(RecordingAlertService::default());
        let cache = LruCache::new(
            1000,
            800,
            600,
            Arc::new(|| Err(Error::storage("metadata store down"))),
            Box::new(|_: &String| {}),
            vec![entry("a", 900, 0)],
            Arc::clone(&executor) as Arc<dyn EvictionExecutor>,
            Arc::clone(&alerts) as Arc<dyn AlertService>,
        )
        .unwrap();
        executor.run_all();
        assert_eq!(alerts.alerts()[0].0, AlertLevel::Error);
        assert!(!cache.is_eviction_running());
        assert!(cache.contains_entry(&"a".to_string()));
    }

    #[test]
    fn test_entries_confirmed_during_eviction_are_pending() {
        let f = fixture(vec![entry("a", 700, 0)]);
        f.cache.reserve_entry(entry("b", 200, 1)).unwrap();
        assert!(f.cache.is_eviction_running());

        // Confirmed while the pass is scheduled: kept out of its snapshot
        f.cache.confirm_reservation(&"b".to_string()).unwrap();
        assert!(f.cache.contains_entry(&"b".to_string()));
        assert!(f.cache.update_entry_access_timestamp(&"b".to_string(), at(5)));

        f.executor.run_all();
        assert_eq!(*f.evicted.lock(), vec!["a".to_string()]);
        assert!(f.cache.contains_entry(&"b".to_string()));
        assert_eq!(f.cache.current_capacity(), 200);
        f.cache.assert_consistent();
    }

    #[test]
    fn test_listener_runs_with_cache_unlocked() {
        let executor = Arc::new(ManualExecutor::default());
        let shared: Arc<Mutex<Option<LruCache<String>>>> = Arc::default();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (listener_cache, listener_observed) = (Arc::clone(&shared), Arc::clone(&observed));
        let cache = LruCache::new(
            1000,
            800,
            600,
            Arc::new(|| Ok(Box::new(|_: &String| true) as Box<dyn EvictionJudge<String>>)),
            Box::new(move |key: &String| {
                let guard = listener_cache.lock();
                let Some(cache) = guard.as_ref() else {
                    return;
                };
                // Both calls need the state lock
                let contained = cache.contains_entry(key);
                let reserved = cache.reserve_entry(LruCacheEntry::new(key.clone(), 1, at(9)));
                listener_observed.lock().push((contained, reserved.is_ok()));
            }),
            vec![entry("a", 500, 0), entry("b", 400, 1)],
            Arc::clone(&executor) as Arc<dyn EvictionExecutor>,
            Arc::new(RecordingAlertService::default()),
        )
        .unwrap();
        *shared.lock() = Some(cache.clone());

        assert_eq!(executor.run_all(), 1);
        // Evicted before its listener runs, and not reservable until it returns
        assert_eq!(*observed.lock(), vec![(false, false)]);
        assert!(!cache.contains_entry(&"a".to_string()));
        cache.reserve_entry(entry("a", 10, 10)).unwrap();
        cache.assert_consistent();
        shared.lock().take();
    }

    #[test]
    fn test_update_unknown_entry() {
        let f = fixture(Vec::new());
        assert!(!f.cache.update_entry_access_timestamp(&"x".to_string(), at(0)));
        f.cache.reserve_entry(entry("r", 10, 0)).unwrap();
        assert!(f.cache.update_entry_access_timestamp(&"r".to_string(), at(1)));
        assert_eq!(f.cache.reserved_entry(&"r".to_string()).unwrap().last_access, at(1));
    }
}
