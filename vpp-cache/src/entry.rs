//! Cache entry bookkeeping.

use std::time::Duration;
use vpp_core::{elapsed_between, Timestamp};

/// A stored value plus the metadata eviction policies look at.
///
/// Mutated in place on every read (`touch`), replaced wholesale on every write.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    cached_at: Timestamp,
    last_accessed_at: Timestamp,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    /// A fresh entry; counts as its first access.
    pub fn new(value: V, now: Timestamp) -> Self {
        Self {
            value,
            cached_at: now,
            last_accessed_at: now,
            access_count: 1,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn cached_at(&self) -> Timestamp {
        self.cached_at
    }

    pub fn last_accessed_at(&self) -> Timestamp {
        self.last_accessed_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Record a read.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_accessed_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn age(&self, now: Timestamp) -> Duration {
        elapsed_between(self.cached_at, now)
    }

    /// Strictly older than `ttl`; an entry exactly `ttl` old is still served.
    pub fn is_expired(&self, ttl: Duration, now: Timestamp) -> bool {
        self.age(now) > ttl
    }
}
