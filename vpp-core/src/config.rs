//! Configuration types

use crate::error::{ConfigError, VppError, VppResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// EVICTION POLICY
// ============================================================================

/// Which entry makes room when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently accessed entry goes first.
    #[default]
    Lru,
    /// Entry with the lowest access count goes first.
    Lfu,
    /// Entry with the oldest insertion time goes first.
    Fifo,
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Fifo => "fifo",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            _ => Err(ConfigError::UnknownEvictionPolicy {
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Configuration for an entity cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held at once.
    pub max_entries: usize,
    /// Entries older than this are never returned.
    pub ttl: Duration,
    /// Which entry to drop when full.
    pub eviction_policy: EvictionPolicy,
    /// How often the background sweeper purges expired entries.
    pub sweep_interval: Duration,
    /// Whether the sweeper also drops entity streams nobody listens to.
    pub prune_idle_streams: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(300),
            eviction_policy: EvictionPolicy::Lru,
            sweep_interval: Duration::from_secs(60),
            prune_idle_streams: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_idle_stream_pruning(mut self, enabled: bool) -> Self {
        self.prune_idle_streams = enabled;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `VPP_CACHE_MAX_ENTRIES`: Maximum cached entries (default: 1000)
    /// - `VPP_CACHE_TTL_MS`: Entry time-to-live in milliseconds (default: 300000)
    /// - `VPP_CACHE_EVICTION`: `lru`, `lfu` or `fifo` (default: lru)
    /// - `VPP_CACHE_SWEEP_INTERVAL_MS`: Stale sweep interval in milliseconds (default: 60000)
    ///
    /// Unparseable or zero values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_entries: std::env::var("VPP_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_entries),
            ttl: std::env::var("VPP_CACHE_TTL_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.ttl),
            eviction_policy: std::env::var("VPP_CACHE_EVICTION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.eviction_policy),
            sweep_interval: std::env::var("VPP_CACHE_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            prune_idle_streams: defaults.prune_idle_streams,
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_entries > 0
    /// - ttl and sweep_interval are positive
    pub fn validate(&self) -> VppResult<()> {
        if self.max_entries == 0 {
            return Err(VppError::Config(ConfigError::InvalidValue {
                field: "max_entries".to_string(),
                value: self.max_entries.to_string(),
                reason: "max_entries must be greater than 0".to_string(),
            }));
        }

        if self.ttl.is_zero() {
            return Err(VppError::Config(ConfigError::InvalidValue {
                field: "ttl".to_string(),
                value: format!("{:?}", self.ttl),
                reason: "ttl must be positive".to_string(),
            }));
        }

        if self.sweep_interval.is_zero() {
            return Err(VppError::Config(ConfigError::InvalidValue {
                field: "sweep_interval".to_string(),
                value: format!("{:?}", self.sweep_interval),
                reason: "sweep_interval must be positive".to_string(),
            }));
        }

        Ok(())
    }
}
