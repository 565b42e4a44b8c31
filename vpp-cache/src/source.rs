//! Per-type entity source.
//!
//! An [`EntitySource`] owns one long-lived [`StateChannel`] per entity id and
//! hands every subscriber its own view of it. Loads go cache, then local
//! store, then remote; remote fetches are deduplicated through a
//! [`RefreshCoordinator`] and written back to the store and the cache.
//!
//! Each subscriber carries its own [`FetchConfiguration`]. A `Done` value that
//! does not satisfy it is held back while the [`RelationResolver`] fills the
//! missing relations, and the hydrated value is emitted instead.
//!
//! Sources are plain values with explicit ownership: construct one per entity
//! type, share it behind an `Arc`, and call [`EntitySource::shutdown`] when
//! done. Methods that start background work must run inside a tokio runtime.

use async_stream::stream;
use dashmap::{DashMap, DashSet};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use vpp_core::{
    elapsed_between, Alias, AliasIndex, CacheConfig, Clock, DataTags, EntityId, RefreshError,
    StateError, SystemClock, Timestamp, VppError, VppResult,
};

use crate::cacheable::{Cacheable, FetchConfiguration};
use crate::coordinator::RefreshCoordinator;
use crate::freshness::Freshness;
use crate::intelligent::IntelligentCache;
use crate::state::{get_first_value, AliasState, CacheState, ItemState, StateChannel};
use crate::store::InMemoryStore;
use crate::sweeper::Sweep;
use crate::traits::{CacheableEntity, LocalStore, NoRelations, RelationResolver, RemoteFetcher};

type Channel<T> = StateChannel<EntityId, T>;

/// Reactive, deduplicating access to one entity type.
pub struct EntitySource<T: CacheableEntity> {
    config: CacheConfig,
    cache: Arc<IntelligentCache<EntityId, T>>,
    /// Remote fetches, keyed by entity id or alias.
    refreshes: RefreshCoordinator<Option<T>>,
    /// Store-then-remote loads, keyed by entity id.
    loads: RefreshCoordinator<()>,
    store: Arc<dyn LocalStore<T>>,
    remote: Arc<dyn RemoteFetcher<T>>,
    resolver: Arc<dyn RelationResolver<T>>,
    streams: Mutex<HashMap<EntityId, Arc<Channel<T>>>>,
    aliases: Mutex<AliasIndex>,
    /// When each id was last confirmed by the remote.
    confirmed: DashMap<EntityId, Timestamp>,
    /// Ids the remote last reported as not existing. Their store copies are
    /// stale and never read back.
    absent: DashSet<EntityId>,
    clock: Arc<dyn Clock>,
}

impl<T: CacheableEntity> EntitySource<T> {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn LocalStore<T>>,
        remote: Arc<dyn RemoteFetcher<T>>,
    ) -> Self {
        let cache = Arc::new(IntelligentCache::from_config(&config));
        Self {
            config,
            cache,
            refreshes: RefreshCoordinator::new(),
            loads: RefreshCoordinator::new(),
            store,
            remote,
            resolver: Arc::new(NoRelations),
            streams: Mutex::new(HashMap::new()),
            aliases: Mutex::new(AliasIndex::new()),
            confirmed: DashMap::new(),
            absent: DashSet::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// A source whose local store lives only in memory.
    pub fn in_memory(config: CacheConfig, remote: Arc<dyn RemoteFetcher<T>>) -> Self {
        Self::new(config, Arc::new(InMemoryStore::new()), remote)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RelationResolver<T>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use `clock` for TTL and staleness decisions. Drops anything cached so far.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let cache = IntelligentCache::from_config(&self.config).with_clock(Arc::clone(&clock));
        self.cache = Arc::new(cache);
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<IntelligentCache<EntityId, T>> {
        &self.cache
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Observe `id`, hydrated to `configuration`, trusting any held value.
    pub fn get(
        self: &Arc<Self>,
        id: EntityId,
        configuration: FetchConfiguration<T::Fetch>,
    ) -> BoxStream<'static, CacheState<T>> {
        self.get_with(id, configuration, Freshness::CacheFirst)
    }

    /// Observe `id`, going remote as `freshness` demands.
    ///
    /// The stream replays the current state first and then follows every
    /// change until the source shuts down or prunes the id.
    pub fn get_with(
        self: &Arc<Self>,
        id: EntityId,
        configuration: FetchConfiguration<T::Fetch>,
        freshness: Freshness,
    ) -> BoxStream<'static, CacheState<T>> {
        let (channel, created) = self.channel_for(&id);

        match self.cache.get(&id) {
            Some(value) => {
                trace!(entity_id = %id, "cache hit");
                if created {
                    publish_to(&channel, ItemState::Done(value));
                }
                if freshness.needs_remote(self.confirmed_age(&id)) {
                    debug!(entity_id = %id, ?freshness, "held value needs remote confirmation");
                    self.spawn_remote(id.clone());
                }
            }
            None if created => {
                debug!(entity_id = %id, "cache miss, loading");
                self.spawn_load(id.clone(), freshness);
            }
            None => {
                // A resolved value that fell out of the cache is re-derived.
                // NotExisting and Error stay put until an explicit refresh.
                if matches!(channel.current(), ItemState::Done(_)) {
                    debug!(entity_id = %id, "cached value expired, reloading");
                    self.spawn_load(id.clone(), freshness);
                }
            }
        }

        subscriber_stream(&channel, Arc::clone(&self.resolver), configuration)
    }

    /// First resolved value for `id`, hydrated to `configuration`.
    pub async fn get_first(
        self: &Arc<Self>,
        id: EntityId,
        configuration: FetchConfiguration<T::Fetch>,
    ) -> VppResult<T> {
        get_first_value(self.get(id, configuration), DataTags::empty()).await
    }

    /// Observe the entity a provider knows as `alias`.
    ///
    /// Unknown aliases are looked up remotely through
    /// [`RemoteFetcher::fetch_by_alias`]; the fetched entity's aliases are
    /// registered so later lookups stay local.
    pub fn get_by_alias(
        self: &Arc<Self>,
        alias: Alias,
        configuration: FetchConfiguration<T::Fetch>,
    ) -> BoxStream<'static, AliasState<T>> {
        let source = Arc::clone(self);
        let known = self.resolve_alias(&alias);

        stream! {
            yield ItemState::Loading(alias.clone());

            let id = match known {
                Some(id) => id,
                None => match source.fetch_alias(&alias).await {
                    Ok(Some(value)) => value.entity_id(),
                    Ok(None) => {
                        yield ItemState::NotExisting(alias.clone());
                        return;
                    }
                    Err(cause) => {
                        yield ItemState::Error(alias.clone(), cause);
                        return;
                    }
                },
            };

            let mut loading = true;
            let mut states = source.get(id, configuration);
            while let Some(state) = states.next().await {
                match state {
                    ItemState::Loading(_) => {
                        if !loading {
                            loading = true;
                            yield ItemState::Loading(alias.clone());
                        }
                    }
                    ItemState::NotExisting(_) => {
                        loading = false;
                        yield ItemState::NotExisting(alias.clone());
                    }
                    ItemState::Error(_, cause) => {
                        loading = false;
                        yield ItemState::Error(alias.clone(), cause);
                    }
                    ItemState::Done(value) => {
                        loading = false;
                        yield ItemState::Done(value);
                    }
                }
            }
        }
        .boxed()
    }

    /// Local id registered for `alias`, ignoring its version.
    pub fn resolve_alias(&self, alias: &Alias) -> Option<EntityId> {
        self.alias_index()
            .resolve_alias(alias)
            .map(EntityId::Surrogate)
    }

    // ------------------------------------------------------------------------
    // Refresh and lifecycle
    // ------------------------------------------------------------------------

    /// Force a remote fetch of `id`. Subscribers see `Loading` and then the
    /// outcome; the outcome is also returned.
    ///
    /// The fetch finishes and publishes even if the caller stops waiting.
    pub async fn refresh(self: &Arc<Self>, id: EntityId) -> VppResult<Option<T>> {
        let (channel, _) = self.channel_for(&id);
        if channel.request_refresh() {
            debug!(entity_id = %id, "forced refresh");
        }
        drop(channel);
        self.remote_load(id).await
    }

    /// Cancel the in-flight remote fetch of `id`, if any. Subscribers see
    /// the cancellation as an error.
    pub fn cancel(&self, id: &EntityId) -> bool {
        if !self.refreshes.cancel_refresh(&id.to_string()) {
            return false;
        }
        let cause = VppError::Refresh(RefreshError::Cancelled {
            entity_id: id.to_string(),
        });
        self.publish(id, ItemState::Error(id.clone(), cause));
        true
    }

    pub fn is_refreshing(&self, id: &EntityId) -> bool {
        let key = id.to_string();
        self.refreshes.is_refreshing(&key) || self.loads.is_refreshing(&key)
    }

    /// Drop the cached value of `id`. Subscribers keep their last state.
    pub fn invalidate(&self, id: &EntityId) -> bool {
        self.confirmed.remove(id);
        self.cache.invalidate(id)
    }

    /// Number of ids with a live state channel.
    pub fn stream_count(&self) -> usize {
        self.streams().len()
    }

    /// Drop state channels nobody subscribes to. Returns how many went.
    pub fn prune_idle_streams(&self) -> usize {
        let mut streams = self.streams();
        let before = streams.len();
        streams.retain(|_, channel| channel.subscriber_count() > 0);
        let pruned = before - streams.len();
        if pruned > 0 {
            debug!(pruned, "pruned idle streams");
        }
        pruned
    }

    /// Cancel every in-flight fetch and close every stream.
    pub fn shutdown(&self) {
        let cancelled = self.refreshes.cancel_all() + self.loads.cancel_all();
        let closed = {
            let mut streams = self.streams();
            let closed = streams.len();
            streams.clear();
            closed
        };
        debug!(cancelled, closed, "entity source shut down");
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    fn spawn_load(self: &Arc<Self>, id: EntityId, freshness: Freshness) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let key = id.to_string();
            let loader = Arc::clone(&this);
            let result = this
                .loads
                .coordinate_refresh(&key, move || async move {
                    loader.load(id, freshness).await;
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                debug!(entity_id = %key, error = %err, "load did not complete");
            }
        });
    }

    fn spawn_remote(self: &Arc<Self>, id: EntityId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.remote_load(id).await;
        });
    }

    /// Store first; remote if the store has nothing or `freshness` asks for it.
    async fn load(self: &Arc<Self>, id: EntityId, freshness: Freshness) {
        if self.absent.contains(&id) {
            trace!(entity_id = %id, "remote reported not existing, skipping local store");
            let _ = self.remote_load(id).await;
            return;
        }
        match self.store.read(&id).await {
            Ok(Some(value)) => {
                let value = value.with_tags(DataTags::LOCAL);
                self.cache.put(id.clone(), value.clone());
                self.publish(&id, ItemState::Done(value));
                if !freshness.needs_remote(self.confirmed_age(&id)) {
                    return;
                }
            }
            Ok(None) => trace!(entity_id = %id, "local store miss"),
            Err(err) => {
                warn!(entity_id = %id, error = %err, "local store read failed, trying remote")
            }
        }
        let _ = self.remote_load(id).await;
    }

    /// Deduplicated remote fetch. The outcome is published by the fetch
    /// itself; a cancellation is published by [`EntitySource::cancel`].
    async fn remote_load(self: &Arc<Self>, id: EntityId) -> VppResult<Option<T>> {
        let this = Arc::clone(self);
        let target = id.clone();
        self.refreshes
            .coordinate_refresh(&id.to_string(), move || async move {
                let result = this.fetch_remote(&target).await;
                this.publish(&target, ItemState::from_result(target.clone(), result.clone()));
                result
            })
            .await
    }

    async fn fetch_remote(&self, id: &EntityId) -> VppResult<Option<T>> {
        debug!(entity_id = %id, "fetching from remote");
        match self.remote.fetch(id).await {
            Ok(Some(value)) => Ok(Some(self.accept_remote(id, value, None).await)),
            Ok(None) => {
                debug!(entity_id = %id, "remote reports entity as not existing");
                self.invalidate(id);
                self.absent.insert(id.clone());
                Ok(None)
            }
            Err(err) => {
                warn!(entity_id = %id, error = %err, "remote fetch failed");
                Err(err)
            }
        }
    }

    async fn fetch_alias(self: &Arc<Self>, alias: &Alias) -> VppResult<Option<T>> {
        let this = Arc::clone(self);
        let requested = alias.clone();
        let key = alias.coordination_key();
        self.refreshes
            .coordinate_refresh(&key, move || async move {
                debug!(alias = %requested, "fetching alias from remote");
                let Some(value) = this.remote.fetch_by_alias(&requested).await? else {
                    return Ok(None);
                };
                let id = value.entity_id();
                let value = this.accept_remote(&id, value, Some(&requested)).await;
                this.publish(&id, ItemState::Done(value.clone()));
                Ok(Some(value))
            })
            .await
    }

    /// Write through, tag, cache and index a freshly fetched value.
    ///
    /// A failed store write is logged and the value is still served, tagged
    /// as remote only.
    async fn accept_remote(&self, id: &EntityId, value: T, requested: Option<&Alias>) -> T {
        let tags = match self.store.write(id, &value).await {
            Ok(()) => DataTags::LOCAL | DataTags::REMOTE,
            Err(err) => {
                error!(entity_id = %id, error = %err, "write-through to local store failed");
                DataTags::REMOTE
            }
        };
        let value = value.with_tags(tags);
        self.absent.remove(id);
        if let Some(evicted) = self.cache.put(id.clone(), value.clone()) {
            self.confirmed.remove(&evicted);
        }
        self.confirmed.insert(id.clone(), self.clock.now());
        self.register_aliases(&value, requested);
        value
    }

    fn register_aliases(&self, value: &T, requested: Option<&Alias>) {
        let mut aliases = value.aliases();
        if let Some(alias) = requested {
            if !aliases.iter().any(|a| a.lookup_key() == alias.lookup_key()) {
                aliases.push(alias.clone());
            }
        }
        if aliases.is_empty() {
            return;
        }
        let id = value.entity_id();
        let Some(local_id) = id.as_surrogate() else {
            debug!(entity_id = %id, "aliases on a locally owned id are not indexed");
            return;
        };
        if let Err(err) = self.alias_index().register(local_id, aliases) {
            warn!(entity_id = %id, error = %err, "alias registration rejected");
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn streams(&self) -> MutexGuard<'_, HashMap<EntityId, Arc<Channel<T>>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alias_index(&self) -> MutexGuard<'_, AliasIndex> {
        self.aliases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_for(&self, id: &EntityId) -> (Arc<Channel<T>>, bool) {
        let mut streams = self.streams();
        if let Some(channel) = streams.get(id) {
            return (Arc::clone(channel), false);
        }
        let channel = Arc::new(StateChannel::new(id.clone()));
        streams.insert(id.clone(), Arc::clone(&channel));
        (channel, true)
    }

    fn publish(&self, id: &EntityId, state: CacheState<T>) {
        let channel = self.streams().get(id).cloned();
        match channel {
            Some(channel) => publish_to(&channel, state),
            None => trace!(entity_id = %id, "no stream to publish to"),
        }
    }

    fn confirmed_age(&self, id: &EntityId) -> Option<Duration> {
        self.confirmed
            .get(id)
            .map(|at| elapsed_between(*at, self.clock.now()))
    }
}

impl<T: CacheableEntity> Sweep for EntitySource<T> {
    fn sweep(&self) -> usize {
        let removed = self.cache.evict_stale();
        if self.config.prune_idle_streams {
            self.prune_idle_streams();
        }
        removed
    }
}

impl<T: CacheableEntity> std::fmt::Debug for EntitySource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySource")
            .field("cache", &self.cache)
            .field("refreshes", &self.refreshes)
            .field("streams", &self.stream_count())
            .finish()
    }
}

fn publish_to<T>(channel: &Channel<T>, state: CacheState<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if let Err(err) = channel.resolve(state) {
        error!(entity_id = %channel.id(), error = %err, "dropped state update");
    }
}

/// One subscriber's view of a channel, hydrated to its configuration.
fn subscriber_stream<T: CacheableEntity>(
    channel: &Channel<T>,
    resolver: Arc<dyn RelationResolver<T>>,
    configuration: FetchConfiguration<T::Fetch>,
) -> BoxStream<'static, CacheState<T>> {
    let mut states = channel.stream();
    stream! {
        while let Some(state) = states.next().await {
            match state {
                ItemState::Done(value) => {
                    yield ItemState::Done(hydrate(resolver.as_ref(), value, &configuration).await);
                }
                other => yield other,
            }
        }
    }
    .boxed()
}

/// Fill relations `configuration` names but `value` does not hold yet.
///
/// Relations still loading or failed count as satisfied here; only ones never
/// requested trigger the resolver. One attempt per emitted value.
async fn hydrate<T: CacheableEntity>(
    resolver: &dyn RelationResolver<T>,
    value: T,
    configuration: &FetchConfiguration<T::Fetch>,
) -> T {
    let FetchConfiguration::Fetch(fetch) = configuration else {
        return value;
    };
    if value.is_config_satisfied(fetch, true) {
        return value;
    }
    let id = value.entity_id();
    trace!(entity_id = %id, "hydrating relations");
    let hydrated = resolver.resolve(value, fetch).await;
    if !hydrated.is_config_satisfied(fetch, true) {
        warn!(entity_id = %id, "relations still unresolved after hydration");
    }
    hydrated
}

/// Bring one relation slot up to `configuration` through its own source.
///
/// Slots that already satisfy the configuration are returned untouched.
/// Otherwise the related entity is loaded and hydrated; absence becomes
/// `NotExisting` and any other failure becomes `Error`.
pub async fn resolve_relation<R: CacheableEntity>(
    current: Cacheable<R>,
    configuration: &FetchConfiguration<R::Fetch>,
    source: &Arc<EntitySource<R>>,
) -> Cacheable<R> {
    if current.is_config_satisfied(configuration, false) {
        return current;
    }
    let id = current.get_item_id();
    match source.get_first(id.clone(), configuration.clone()).await {
        Ok(value) => Cacheable::Loaded(value),
        Err(VppError::State(StateError::NotExisting { .. })) => Cacheable::NotExisting(id),
        Err(cause) => Cacheable::Error { id, cause },
    }
}
