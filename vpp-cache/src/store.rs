//! In-memory local store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use vpp_core::{EntityId, VppResult};

use crate::traits::{CacheableEntity, LocalStore};

/// [`LocalStore`] backed by a map, for tests and ephemeral sessions.
///
/// Uses tokio::sync::RwLock for safe async access.
#[derive(Debug)]
pub struct InMemoryStore<T> {
    items: RwLock<HashMap<EntityId, T>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl<T: CacheableEntity> InMemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-filled with `items`, keyed by their entity ids.
    pub fn with_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let items = items
            .into_iter()
            .map(|item| (item.entity_id(), item))
            .collect();
        Self {
            items: RwLock::new(items),
            ..Self::default()
        }
    }

    pub async fn get(&self, id: &EntityId) -> Option<T> {
        self.items.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &EntityId) -> Option<T> {
        self.items.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Number of `read` calls served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write` calls served.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<T: CacheableEntity> LocalStore<T> for InMemoryStore<T> {
    async fn read(&self, id: &EntityId) -> VppResult<Option<T>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn write(&self, id: &EntityId, value: &T) -> VppResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.items.write().await.insert(id.clone(), value.clone());
        Ok(())
    }
}
