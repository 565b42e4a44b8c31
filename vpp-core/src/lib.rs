//! VPP Core - Shared Types
//!
//! Pure data types used by the entity cache and its collaborators:
//! identities and provider aliases, provenance tags, the error taxonomy,
//! cache configuration and clocks. No caching logic lives here.

pub mod config;
pub mod error;
pub mod identity;
pub mod tags;
pub mod time;

pub use config::{CacheConfig, EvictionPolicy};
pub use error::{
    ConfigError, FetchError, RefreshError, StateError, StoreError, ValidationError, VppError,
    VppResult,
};
pub use identity::{new_surrogate_id, Alias, AliasIndex, AliasProvider, EntityId, Timestamp};
pub use tags::{DataTags, Tagged};
pub use time::{elapsed_between, Clock, ManualClock, SystemClock};
