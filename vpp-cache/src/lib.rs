//! VPP Cache - Entity Cache and Reactive Hydration
//!
//! Sits between persistence, remote APIs and UI consumers:
//!
//! - [`IntelligentCache`]: bounded TTL cache with LRU/LFU/FIFO eviction
//! - [`RefreshCoordinator`]: at most one in-flight refresh per entity id
//! - [`ItemState`] / [`StateChannel`]: the live per-item state machine
//! - [`Cacheable`] / [`FetchConfiguration`]: partial loading of entity graphs
//! - [`EntitySource`]: per-type composition of all of the above
//!
//! # Example
//!
//! ```ignore
//! let source = Arc::new(EntitySource::new(config, store, remote).with_resolver(resolver));
//! let mut states = source.get(EntityId::Int(12), FetchConfiguration::Fetch(fetch));
//! while let Some(state) = states.next().await {
//!     render(state);
//! }
//! ```

pub mod cacheable;
pub mod coordinator;
pub mod entry;
pub mod freshness;
pub mod intelligent;
pub mod source;
pub mod state;
pub mod stats;
pub mod store;
pub mod sweeper;
pub mod traits;

pub use cacheable::{is_config_satisfied, Cacheable, ConfigSatisfaction, FetchConfiguration};
pub use coordinator::RefreshCoordinator;
pub use entry::CacheEntry;
pub use freshness::Freshness;
pub use intelligent::IntelligentCache;
pub use source::{resolve_relation, EntitySource};
pub use state::{get_first_value, AliasState, CacheState, ItemState, StateChannel, StateStreamExt};
pub use stats::CacheStats;
pub use store::InMemoryStore;
pub use sweeper::{
    spawn_stale_sweeper, stale_sweeper_task, Sweep, SweeperMetrics, SweeperSnapshot,
};
pub use traits::{CacheableEntity, LocalStore, NoRelations, RelationResolver, RemoteFetcher};

// Re-export the shared types so downstream crates need a single import.
pub use vpp_core::{
    Alias, AliasIndex, AliasProvider, CacheConfig, Clock, DataTags, EntityId, EvictionPolicy,
    ManualClock, SystemClock, Tagged, VppError, VppResult,
};
