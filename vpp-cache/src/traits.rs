//! Collaborator traits and the cacheable entity contract.
//!
//! The cache core never talks to a database or a network client directly.
//! Persistence is a [`LocalStore`], remote APIs are a [`RemoteFetcher`], and
//! composite entities fill their relations through a [`RelationResolver`].

use async_trait::async_trait;
use vpp_core::{Alias, DataTags, EntityId, Tagged, VppResult};

use crate::cacheable::ConfigSatisfaction;

/// Types that can be served by an [`EntitySource`](crate::EntitySource).
///
/// # Implementation Requirements
///
/// - `entity_id()` must be stable for the lifetime of the item
/// - `with_tags()` adds provenance tags; it never removes existing ones
/// - `aliases()` lists provider identifiers for alias-bearing items and is
///   empty for locally owned ones
/// - Implementations must be `Clone + Send + Sync + 'static` so one value can
///   be handed to many subscribers across tasks
pub trait CacheableEntity: ConfigSatisfaction + Tagged + Clone + Send + Sync + 'static {
    fn entity_id(&self) -> EntityId;

    fn with_tags(self, tags: DataTags) -> Self;

    fn aliases(&self) -> Vec<Alias> {
        Vec::new()
    }
}

/// Durable key-value access to persisted entities.
///
/// Read on a cold cache, written after every successful remote fetch.
#[async_trait]
pub trait LocalStore<T: CacheableEntity>: Send + Sync {
    /// Returns `Ok(None)` when nothing is stored under `id`.
    async fn read(&self, id: &EntityId) -> VppResult<Option<T>>;

    async fn write(&self, id: &EntityId, value: &T) -> VppResult<()>;
}

/// Remote source of truth for one entity type.
#[async_trait]
pub trait RemoteFetcher<T: CacheableEntity>: Send + Sync {
    /// Fetch by local id. `Ok(None)` means the remote says it does not exist.
    async fn fetch(&self, id: &EntityId) -> VppResult<Option<T>>;

    /// Fetch by provider alias. Fetchers without alias support report absence.
    async fn fetch_by_alias(&self, _alias: &Alias) -> VppResult<Option<T>> {
        Ok(None)
    }
}

/// Fills the relations a fetch description names.
///
/// Implementations typically look each relation up through the nested type's
/// own `EntitySource` and replace the slot with the result. Slots that cannot
/// be resolved are left as `Error` or `NotExisting`, never dropped.
#[async_trait]
pub trait RelationResolver<T: CacheableEntity>: Send + Sync {
    async fn resolve(&self, item: T, fetch: &T::Fetch) -> T;
}

/// Resolver for types without relations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRelations;

#[async_trait]
impl<T: CacheableEntity> RelationResolver<T> for NoRelations {
    async fn resolve(&self, item: T, _fetch: &T::Fetch) -> T {
        item
    }
}
