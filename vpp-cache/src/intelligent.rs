//! Bounded in-memory cache with TTL expiry and pluggable eviction.
//!
//! Values live in a concurrent map so `size()` and `contains()` never wait on
//! writers. Every mutation, and the metadata update on `get`, runs under one
//! bookkeeping mutex that also owns the access-order sequence.
//!
//! # Eviction tie-breaks
//!
//! LFU and FIFO scan the access-order sequence from least to most recently
//! used and keep the first minimum they find. Among equal access counts (LFU)
//! or equal insertion times (FIFO) the least recently used key therefore goes
//! first. This is deterministic for a given history but is not a promise of
//! "true oldest wins" when timestamps collide.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};
use vpp_core::{CacheConfig, Clock, EvictionPolicy, SystemClock};

use crate::entry::CacheEntry;
use crate::stats::CacheStats;

/// State guarded by the cache lock.
#[derive(Debug)]
struct Bookkeeping<K> {
    /// Least recently used at the front.
    order: VecDeque<K>,
    stats: CacheStats,
}

impl<K: PartialEq + Clone> Bookkeeping<K> {
    fn promote(&mut self, key: &K) {
        self.forget(key);
        self.order.push_back(key.clone());
    }

    fn forget(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

/// Keyed store of [`CacheEntry`] values bounded by entry count and age.
pub struct IntelligentCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    book: Mutex<Bookkeeping<K>>,
    max_entries: usize,
    ttl: Duration,
    policy: EvictionPolicy,
    clock: Arc<dyn Clock>,
}

impl<K, V> IntelligentCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Create a cache reading wall-clock time.
    ///
    /// A `max_entries` of zero is treated as one.
    pub fn new(max_entries: usize, ttl: Duration, policy: EvictionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            book: Mutex::new(Bookkeeping {
                order: VecDeque::new(),
                stats: CacheStats::default(),
            }),
            max_entries: max_entries.max(1),
            ttl,
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl, config.eviction_policy)
    }

    /// Replace the time source, e.g. with a `ManualClock` in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    // The bookkeeping stays consistent across a panicking holder: every
    // critical section leaves `order` and `entries` in agreement before it can
    // unwind, so a poisoned lock is safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Bookkeeping<K>> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the value if present and unexpired.
    ///
    /// An expired entry is dropped as a side effect. A hit refreshes the
    /// entry's access metadata and moves it to the most recently used end.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_with_age(key).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also reporting how long ago the value was cached.
    pub fn get_with_age(&self, key: &K) -> Option<(V, Duration)> {
        let mut book = self.lock();
        let now = self.clock.now();

        let hit = match self.entries.get_mut(key) {
            None => None,
            Some(mut entry) => {
                if entry.is_expired(self.ttl, now) {
                    Some(None)
                } else {
                    entry.touch(now);
                    Some(Some((entry.value().value().clone(), entry.age(now))))
                }
            }
        };

        match hit {
            Some(Some(found)) => {
                book.stats.hits += 1;
                book.promote(key);
                trace!(key = ?key, "cache hit");
                Some(found)
            }
            Some(None) => {
                self.entries.remove(key);
                book.forget(key);
                book.stats.expirations += 1;
                book.stats.misses += 1;
                debug!(key = ?key, "cache entry expired on read");
                None
            }
            None => {
                book.stats.misses += 1;
                trace!(key = ?key, "cache miss");
                None
            }
        }
    }

    /// Insert or overwrite `key`.
    ///
    /// Inserting a new key into a full cache first evicts exactly one entry
    /// chosen by the eviction policy; overwriting never evicts. Returns the
    /// evicted key, if any.
    pub fn put(&self, key: K, value: V) -> Option<K> {
        let mut book = self.lock();
        let now = self.clock.now();

        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            if let Some(victim) = self.select_victim(&book) {
                self.entries.remove(&victim);
                book.forget(&victim);
                book.stats.evictions += 1;
                debug!(evicted = ?victim, policy = %self.policy, "cache full, evicted entry");
                evicted = Some(victim);
            }
        }

        self.entries.insert(key.clone(), CacheEntry::new(value, now));
        book.promote(&key);
        evicted
    }

    fn select_victim(&self, book: &Bookkeeping<K>) -> Option<K> {
        match self.policy {
            EvictionPolicy::Lru => book.order.front().cloned(),
            EvictionPolicy::Lfu => self.first_minimum(book, |entry| entry.access_count()),
            EvictionPolicy::Fifo => self.first_minimum(book, |entry| entry.cached_at()),
        }
    }

    fn first_minimum<O, F>(&self, book: &Bookkeeping<K>, rank: F) -> Option<K>
    where
        O: Ord,
        F: Fn(&CacheEntry<V>) -> O,
    {
        let mut best: Option<(&K, O)> = None;
        for key in &book.order {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let score = rank(entry.value());
            // Strict comparison: the earlier key in access order keeps ties.
            if best.as_ref().map_or(true, |(_, current)| score < *current) {
                best = Some((key, score));
            }
        }
        best.map(|(key, _)| key.clone())
    }

    /// Remove one key. Returns whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut book = self.lock();
        book.forget(key);
        self.entries.remove(key).is_some()
    }

    /// Remove every entry the predicate selects. Returns how many were removed.
    pub fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K, &V) -> bool,
    {
        let mut book = self.lock();
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|item| predicate(item.key(), item.value().value()))
            .map(|item| item.key().clone())
            .collect();

        for key in &doomed {
            self.entries.remove(key);
            book.forget(key);
        }
        doomed.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut book = self.lock();
        self.entries.clear();
        book.order.clear();
    }

    /// Remove all TTL-expired entries. Returns how many were removed.
    pub fn evict_stale(&self) -> usize {
        let mut book = self.lock();
        let now = self.clock.now();
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|item| item.value().is_expired(self.ttl, now))
            .map(|item| item.key().clone())
            .collect();

        for key in &stale {
            self.entries.remove(key);
            book.forget(key);
        }
        book.stats.expirations += stale.len() as u64;
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept stale cache entries");
        }
        stale.len()
    }

    /// Number of stored entries, expired ones included until purged.
    ///
    /// Does not take the cache lock; may lag one in-flight mutation.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry is stored, without checking its age.
    ///
    /// Does not take the cache lock; may lag one in-flight mutation.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys from least to most recently used.
    pub fn access_order(&self) -> Vec<K> {
        self.lock().order.iter().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let book = self.lock();
        CacheStats {
            entry_count: self.entries.len() as u64,
            ..book.stats.clone()
        }
    }
}

impl<K: Eq + Hash, V> std::fmt::Debug for IntelligentCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntelligentCache")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .field("policy", &self.policy)
            .field("current_size", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vpp_core::ManualClock;

    fn lru(max: usize) -> IntelligentCache<String, i32> {
        IntelligentCache::new(max, Duration::from_secs(60), EvictionPolicy::Lru)
    }

    fn with_manual_clock(
        max: usize,
        ttl: Duration,
        policy: EvictionPolicy,
    ) -> (IntelligentCache<String, i32>, ManualClock) {
        let clock = ManualClock::starting_now();
        let cache = IntelligentCache::new(max, ttl, policy).with_clock(Arc::new(clock.clone()));
        (cache, clock)
    }

    fn k(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_lru_touch_protects_first_key() {
        let (cache, _clock) =
            with_manual_clock(2, Duration::from_millis(1000), EvictionPolicy::Lru);
        cache.put(k("a"), 1);
        cache.put(k("b"), 2);
        assert_eq!(cache.get(&k("a")), Some(1));

        let evicted = cache.put(k("c"), 3);

        assert_eq!(evicted, Some(k("b")));
        assert_eq!(cache.get(&k("b")), None);
        assert_eq!(cache.get(&k("a")), Some(1));
        assert_eq!(cache.get(&k("c")), Some(3));
    }

    #[test]
    fn test_lru_without_reads_evicts_first_inserted() {
        let cache = lru(3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.put(k(key), i as i32);
        }
        assert_eq!(cache.put(k("d"), 3), Some(k("a")));
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn test_fifo_ignores_reads() {
        let (cache, clock) = with_manual_clock(2, Duration::from_secs(60), EvictionPolicy::Fifo);
        cache.put(k("a"), 1);
        clock.advance(Duration::from_millis(5));
        cache.put(k("b"), 2);
        cache.get(&k("a"));

        assert_eq!(cache.put(k("c"), 3), Some(k("a")));
    }

    #[test]
    fn test_lfu_evicts_least_used() {
        let cache = IntelligentCache::new(3, Duration::from_secs(60), EvictionPolicy::Lfu);
        cache.put(k("a"), 1);
        cache.put(k("b"), 2);
        cache.put(k("c"), 3);
        cache.get(&k("a"));
        cache.get(&k("a"));
        cache.get(&k("c"));

        assert_eq!(cache.put(k("d"), 4), Some(k("b")));
    }

    #[test]
    fn test_lfu_tie_goes_to_least_recently_used() {
        let cache = IntelligentCache::new(2, Duration::from_secs(60), EvictionPolicy::Lfu);
        cache.put(k("a"), 1);
        cache.put(k("b"), 2);
        // Both have one access; "a" sits at the front of the access order.
        assert_eq!(cache.put(k("c"), 3), Some(k("a")));
    }

    #[test]
    fn test_overwrite_never_evicts_and_resets_count() {
        let cache = IntelligentCache::new(2, Duration::from_secs(60), EvictionPolicy::Lfu);
        cache.put(k("a"), 1);
        cache.put(k("b"), 2);
        cache.get(&k("a"));
        cache.get(&k("a"));

        assert_eq!(cache.put(k("a"), 10), None);
        assert_eq!(cache.size(), 2);
        // "a" was reset to a single access, "b" has one too; "b" is older in access order.
        assert_eq!(cache.put(k("c"), 3), Some(k("b")));
        assert_eq!(cache.get(&k("a")), Some(10));
    }

    #[test]
    fn test_ttl_expiry_on_read_without_sweep() {
        let (cache, clock) =
            with_manual_clock(10, Duration::from_millis(1000), EvictionPolicy::Lru);
        cache.put(k("a"), 1);

        clock.advance(Duration::from_millis(1000));
        assert_eq!(cache.get(&k("a")), Some(1));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&k("a")), None);
        assert!(!cache.contains(&k("a")));
        assert!(cache.access_order().is_empty());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_get_with_age() {
        let (cache, clock) = with_manual_clock(10, Duration::from_secs(10), EvictionPolicy::Lru);
        cache.put(k("a"), 1);
        clock.advance(Duration::from_secs(4));
        let (value, age) = cache.get_with_age(&k("a")).unwrap();
        assert_eq!(value, 1);
        assert_eq!(age, Duration::from_secs(4));
    }

    #[test]
    fn test_evict_stale_sweeps_only_expired() {
        let (cache, clock) = with_manual_clock(10, Duration::from_secs(1), EvictionPolicy::Lru);
        cache.put(k("old1"), 1);
        cache.put(k("old2"), 2);
        clock.advance(Duration::from_secs(2));
        cache.put(k("new"), 3);

        assert_eq!(cache.evict_stale(), 2);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.access_order(), vec![k("new")]);
    }

    #[test]
    fn test_invalidate_and_clear_keep_order_in_sync() {
        let cache = lru(10);
        cache.put(k("a"), 1);
        cache.put(k("b"), 2);
        cache.put(k("c"), 3);

        assert!(cache.invalidate(&k("b")));
        assert!(!cache.invalidate(&k("b")));
        assert_eq!(cache.access_order(), vec![k("a"), k("c")]);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.access_order().is_empty());
    }

    #[test]
    fn test_invalidate_matching() {
        let cache = lru(10);
        for i in 0..6 {
            cache.put(format!("k{}", i), i);
        }
        let removed = cache.invalidate_matching(|_, v| v % 2 == 0);
        assert_eq!(removed, 3);
        assert_eq!(cache.size(), 3);
        assert_eq!(cache.access_order(), vec![k("k1"), k("k3"), k("k5")]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = lru(0);
        cache.put(k("a"), 1);
        assert_eq!(cache.put(k("b"), 2), Some(k("a")));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_debug_reports_current_size() {
        let cache = lru(4);
        cache.put(k("a"), 1);
        let rendered = format!("{:?}", cache);
        assert!(rendered.starts_with("IntelligentCache"));
        assert!(rendered.contains("current_size: 1"), "{}", rendered);
    }

    #[test]
    fn test_parallel_puts_stay_bounded() {
        let cache = Arc::new(lru(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        cache.put(format!("{}-{}", t, i), i);
                        cache.get(&format!("{}-{}", t, i / 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.size() <= 16);
        assert_eq!(cache.access_order().len(), cache.size());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8),
        Get(u8),
        Invalidate(u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..20).prop_map(Op::Put),
            2 => (0u8..20).prop_map(Op::Get),
            1 => (0u8..20).prop_map(Op::Invalidate),
        ]
    }

    fn arb_policy() -> impl Strategy<Value = EvictionPolicy> {
        prop_oneof![
            Just(EvictionPolicy::Lru),
            Just(EvictionPolicy::Lfu),
            Just(EvictionPolicy::Fifo),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// After any sequence of operations the cache never exceeds its bound
        /// and the access order tracks exactly the stored keys.
        #[test]
        fn prop_size_bounded(
            max in 1usize..8,
            policy in arb_policy(),
            ops in prop::collection::vec(arb_op(), 0..100),
        ) {
            let cache: IntelligentCache<u8, u8> =
                IntelligentCache::new(max, Duration::from_secs(60), policy);
            for op in ops {
                match op {
                    Op::Put(key) => { cache.put(key, key); }
                    Op::Get(key) => { cache.get(&key); }
                    Op::Invalidate(key) => { cache.invalidate(&key); }
                }
                prop_assert!(cache.size() <= max);
            }
            let mut order = cache.access_order();
            order.sort();
            order.dedup();
            prop_assert_eq!(order.len(), cache.size());
        }

        /// No entry older than the TTL is ever returned.
        #[test]
        fn prop_ttl_never_violated(
            steps in prop::collection::vec((0u8..5, 0u64..400), 1..60),
        ) {
            let clock = ManualClock::starting_now();
            let cache: IntelligentCache<u8, vpp_core::Timestamp> =
                IntelligentCache::new(8, Duration::from_millis(500), EvictionPolicy::Lru)
                    .with_clock(Arc::new(clock.clone()));

            for (key, advance_ms) in steps {
                if advance_ms % 3 == 0 {
                    cache.put(key, clock.now());
                }
                clock.advance(Duration::from_millis(advance_ms));
                if let Some(cached_at) = cache.get(&key) {
                    let age = vpp_core::elapsed_between(cached_at, clock.now());
                    prop_assert!(age <= Duration::from_millis(500));
                }
            }
        }
    }
}
