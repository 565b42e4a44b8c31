//! Freshness contracts for entity reads.
//!
//! Callers state how old a value may be before the source goes back to the
//! remote. The cache TTL still applies on top: an expired entry is never
//! served, whatever the contract says.

use std::time::Duration;

/// Freshness requirement for entity reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve any unexpired cached or locally stored value; only go remote
    /// when neither has the item.
    #[default]
    CacheFirst,

    /// Serve the held value, and refresh remotely if it was confirmed longer
    /// ago than `max_staleness` or never confirmed at all.
    BestEffort {
        /// Maximum acceptable age of the last remote confirmation.
        max_staleness: Duration,
    },

    /// Serve the held value, then always confirm with the remote.
    Consistent,
}

impl Freshness {
    /// Create a BestEffort freshness with the given max staleness.
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    pub fn consistent() -> Self {
        Self::Consistent
    }

    pub fn is_cache_first(&self) -> bool {
        matches!(self, Self::CacheFirst)
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::BestEffort { .. })
    }

    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }

    /// Whether a held value needs a remote confirmation.
    ///
    /// `confirmed_age` is how long ago the value was last fetched remotely,
    /// `None` if it only ever came from the local store.
    pub fn needs_remote(&self, confirmed_age: Option<Duration>) -> bool {
        match self {
            Self::CacheFirst => false,
            Self::BestEffort { max_staleness } => match confirmed_age {
                Some(age) => age > *max_staleness,
                None => true,
            },
            Self::Consistent => true,
        }
    }
}
