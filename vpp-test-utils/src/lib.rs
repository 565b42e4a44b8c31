//! VPP Test Utilities
//!
//! Centralized test infrastructure for the VPP workspace:
//! - Mock remote fetchers and stores with latency and failure injection
//! - Proptest generators for identities and operation sequences
//! - A small school domain (School <- Group <- Course) wired through sources
//! - Custom assertions for states and results
//! - Tracing setup for tests

// Re-export core and cache types for convenience
pub use vpp_cache::{
    resolve_relation, AliasState, CacheState, Cacheable, CacheableEntity, ConfigSatisfaction,
    EntitySource, FetchConfiguration, InMemoryStore, ItemState, LocalStore, RelationResolver,
    RemoteFetcher,
};
pub use vpp_core::{
    Alias, AliasProvider, CacheConfig, DataTags, EntityId, EvictionPolicy, FetchError,
    ManualClock, RefreshError, StateError, StoreError, Tagged, VppError, VppResult,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

/// Install a test subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

/// Scriptable remote fetcher.
///
/// Serves whatever was inserted, counts calls per id, and can be told to
/// sleep before answering or to fail the next calls.
#[derive(Debug)]
pub struct MockRemote<T> {
    provider: String,
    items: Mutex<HashMap<EntityId, T>>,
    aliases: Mutex<HashMap<(AliasProvider, String), EntityId>>,
    latency: Mutex<Option<Duration>>,
    scripted_failures: Mutex<VecDeque<FetchError>>,
    failing_ids: Mutex<HashSet<EntityId>>,
    calls: AtomicUsize,
    alias_calls: AtomicUsize,
    calls_by_id: Mutex<HashMap<EntityId, usize>>,
}

impl<T: CacheableEntity> MockRemote<T> {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            items: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            failing_ids: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            alias_calls: AtomicUsize::new(0),
            calls_by_id: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_items<I>(self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.insert(item);
        }
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    /// Serve `item` from now on, replacing any previous version.
    pub fn insert(&self, item: T) {
        let id = item.entity_id();
        {
            let mut aliases = locked(&self.aliases);
            for alias in item.aliases() {
                aliases.insert(alias.lookup_key(), id.clone());
            }
        }
        locked(&self.items).insert(id, item);
    }

    pub fn remove(&self, id: &EntityId) -> Option<T> {
        locked(&self.items).remove(id)
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *locked(&self.latency) = latency;
    }

    /// Fail the next call, whatever id it asks for.
    pub fn fail_next(&self, error: FetchError) {
        locked(&self.scripted_failures).push_back(error);
    }

    /// Fail every call for `id` until [`MockRemote::heal`] is called.
    pub fn fail_id(&self, id: EntityId) {
        locked(&self.failing_ids).insert(id);
    }

    pub fn heal(&self, id: &EntityId) {
        locked(&self.failing_ids).remove(id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, id: &EntityId) -> usize {
        locked(&self.calls_by_id).get(id).copied().unwrap_or(0)
    }

    pub fn alias_calls(&self) -> usize {
        self.alias_calls.load(Ordering::SeqCst)
    }

    fn network_failure(&self) -> FetchError {
        FetchError::Network {
            provider: self.provider.clone(),
            reason: "connection reset".to_string(),
        }
    }

    async fn answer(&self, id: &EntityId) -> VppResult<Option<T>> {
        let latency = *locked(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = locked(&self.scripted_failures).pop_front();
        if let Some(error) = scripted {
            return Err(error.into());
        }
        if locked(&self.failing_ids).contains(id) {
            return Err(self.network_failure().into());
        }
        Ok(locked(&self.items).get(id).cloned())
    }
}

#[async_trait]
impl<T: CacheableEntity> RemoteFetcher<T> for MockRemote<T> {
    async fn fetch(&self, id: &EntityId) -> VppResult<Option<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *locked(&self.calls_by_id).entry(id.clone()).or_insert(0) += 1;
        self.answer(id).await
    }

    async fn fetch_by_alias(&self, alias: &Alias) -> VppResult<Option<T>> {
        self.alias_calls.fetch_add(1, Ordering::SeqCst);
        let id = locked(&self.aliases).get(&alias.lookup_key()).cloned();
        match id {
            Some(id) => self.answer(&id).await,
            None => Ok(None),
        }
    }
}

/// Store whose writes always fail; reads miss or fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    reads_fail: bool,
    write_attempts: AtomicUsize,
}

impl FailingStore {
    /// Reads miss, writes fail.
    pub fn write_only_failures() -> Self {
        Self::default()
    }

    /// Reads and writes both fail.
    pub fn all_failures() -> Self {
        Self {
            reads_fail: true,
            ..Self::default()
        }
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: CacheableEntity> LocalStore<T> for FailingStore {
    async fn read(&self, id: &EntityId) -> VppResult<Option<T>> {
        if self.reads_fail {
            return Err(StoreError::ReadFailed {
                id: id.to_string(),
                reason: "disk unavailable".to_string(),
            }
            .into());
        }
        Ok(None)
    }

    async fn write(&self, id: &EntityId, _value: &T) -> VppResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::WriteFailed {
            id: id.to_string(),
            reason: "disk full".to_string(),
        }
        .into())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for identities, configurations and operation
    //! sequences.

    use super::*;
    use proptest::prelude::*;

    // === Identity Generators ===

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        prop_oneof![
            any::<i64>().prop_map(EntityId::Int),
            "[a-z]{1,8}(/[a-z0-9]{1,6}){0,2}".prop_map(EntityId::Key),
            arb_uuid().prop_map(EntityId::Surrogate),
        ]
    }

    pub fn arb_alias_provider() -> impl Strategy<Value = AliasProvider> {
        prop_oneof![
            Just(AliasProvider::Vpp),
            Just(AliasProvider::Sp24),
            Just(AliasProvider::Schulverwalter),
            "[a-z]{3,10}".prop_map(AliasProvider::Custom),
        ]
    }

    pub fn arb_alias() -> impl Strategy<Value = Alias> {
        (arb_alias_provider(), "[0-9]{1,8}", 1u32..4)
            .prop_map(|(provider, value, version)| Alias::new(provider, value, version))
    }

    // === Configuration Generators ===

    pub fn arb_eviction_policy() -> impl Strategy<Value = EvictionPolicy> {
        prop_oneof![
            Just(EvictionPolicy::Lru),
            Just(EvictionPolicy::Lfu),
            Just(EvictionPolicy::Fifo),
        ]
    }

    /// Valid configurations with small capacities and short TTLs.
    pub fn arb_cache_config() -> impl Strategy<Value = CacheConfig> {
        (1usize..16, 1u64..5_000, arb_eviction_policy()).prop_map(|(max, ttl_ms, policy)| {
            CacheConfig::default()
                .with_max_entries(max)
                .with_ttl(Duration::from_millis(ttl_ms))
                .with_eviction_policy(policy)
        })
    }

    // === Operation Sequences ===

    /// One step against an `IntelligentCache<u8, i32>`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CacheOp {
        Put(u8, i32),
        Get(u8),
        Invalidate(u8),
        /// Move the manual clock forward by this many milliseconds.
        Advance(u16),
        EvictStale,
    }

    pub fn arb_cache_op(key_space: u8) -> impl Strategy<Value = CacheOp> {
        let key = 0..key_space.max(1);
        prop_oneof![
            4 => (key.clone(), any::<i32>()).prop_map(|(k, v)| CacheOp::Put(k, v)),
            3 => key.clone().prop_map(CacheOp::Get),
            1 => key.prop_map(CacheOp::Invalidate),
            1 => (0u16..2_000).prop_map(CacheOp::Advance),
            1 => Just(CacheOp::EvictStale),
        ]
    }

    pub fn arb_cache_ops(key_space: u8, max_len: usize) -> impl Strategy<Value = Vec<CacheOp>> {
        prop::collection::vec(arb_cache_op(key_space), 0..max_len)
    }

    /// How the next remote fetch of an entity ends.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FetchOutcome {
        Found(u32),
        Missing,
        Fails,
    }

    /// One step against a single observed entity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StateOp {
        /// Change what the remote will answer next.
        Script(FetchOutcome),
        /// Force a refresh.
        Refresh,
        /// Read through the source without forcing anything.
        Observe,
    }

    pub fn arb_fetch_outcome() -> impl Strategy<Value = FetchOutcome> {
        prop_oneof![
            3 => any::<u32>().prop_map(FetchOutcome::Found),
            1 => Just(FetchOutcome::Missing),
            1 => Just(FetchOutcome::Fails),
        ]
    }

    pub fn arb_state_ops(max_len: usize) -> impl Strategy<Value = Vec<StateOp>> {
        prop::collection::vec(
            prop_oneof![
                2 => arb_fetch_outcome().prop_map(StateOp::Script),
                2 => Just(StateOp::Refresh),
                1 => Just(StateOp::Observe),
            ],
            1..max_len,
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! A small school domain: a `Course` belongs to a `Group`, a `Group`
    //! belongs to a `School`. Schools are mirrored from stundenplan24 and
    //! carry aliases; groups and courses are locally numbered.

    use super::*;

    // === School ===

    #[derive(Debug, Clone, PartialEq)]
    pub struct School {
        pub id: Uuid,
        pub name: String,
        pub aliases: Vec<Alias>,
        pub tags: DataTags,
    }

    impl School {
        pub fn new(id: Uuid, name: &str, sp24_number: &str) -> Self {
            Self {
                id,
                name: name.to_string(),
                aliases: vec![Alias::new(AliasProvider::Sp24, sp24_number, 1)],
                tags: DataTags::empty(),
            }
        }
    }

    impl Tagged for School {
        fn tags(&self) -> DataTags {
            self.tags
        }
    }

    impl ConfigSatisfaction for School {
        type Fetch = ();

        fn is_config_satisfied(&self, _fetch: &(), _allow_loading: bool) -> bool {
            true
        }
    }

    impl CacheableEntity for School {
        fn entity_id(&self) -> EntityId {
            EntityId::Surrogate(self.id)
        }

        fn with_tags(mut self, tags: DataTags) -> Self {
            self.tags |= tags;
            self
        }

        fn aliases(&self) -> Vec<Alias> {
            self.aliases.clone()
        }
    }

    // === Group ===

    #[derive(Debug, Clone, PartialEq)]
    pub struct Group {
        pub id: i64,
        pub name: String,
        pub school: Cacheable<School>,
        pub tags: DataTags,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct GroupFetch {
        pub school: FetchConfiguration<()>,
    }

    impl Group {
        /// A group whose school has not been requested yet.
        pub fn new(id: i64, name: &str, school: Uuid) -> Self {
            Self {
                id,
                name: name.to_string(),
                school: Cacheable::Uninitialized(EntityId::Surrogate(school)),
                tags: DataTags::empty(),
            }
        }
    }

    impl Tagged for Group {
        fn tags(&self) -> DataTags {
            self.tags
        }
    }

    impl ConfigSatisfaction for Group {
        type Fetch = GroupFetch;

        fn is_config_satisfied(&self, fetch: &GroupFetch, allow_loading: bool) -> bool {
            self.school.is_config_satisfied(&fetch.school, allow_loading)
        }
    }

    impl CacheableEntity for Group {
        fn entity_id(&self) -> EntityId {
            EntityId::Int(self.id)
        }

        fn with_tags(mut self, tags: DataTags) -> Self {
            self.tags |= tags;
            self
        }
    }

    // === Course ===

    #[derive(Debug, Clone, PartialEq)]
    pub struct Course {
        pub id: i64,
        pub subject: String,
        pub group: Cacheable<Group>,
        pub tags: DataTags,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct CourseFetch {
        pub group: FetchConfiguration<GroupFetch>,
    }

    impl Course {
        pub fn new(id: i64, subject: &str, group: i64) -> Self {
            Self {
                id,
                subject: subject.to_string(),
                group: Cacheable::Uninitialized(EntityId::Int(group)),
                tags: DataTags::empty(),
            }
        }
    }

    impl Tagged for Course {
        fn tags(&self) -> DataTags {
            self.tags
        }
    }

    impl ConfigSatisfaction for Course {
        type Fetch = CourseFetch;

        fn is_config_satisfied(&self, fetch: &CourseFetch, allow_loading: bool) -> bool {
            self.group.is_config_satisfied(&fetch.group, allow_loading)
        }
    }

    impl CacheableEntity for Course {
        fn entity_id(&self) -> EntityId {
            EntityId::Int(self.id)
        }

        fn with_tags(mut self, tags: DataTags) -> Self {
            self.tags |= tags;
            self
        }
    }

    // === Fetch configurations ===

    /// Course with its group, group without its school.
    pub fn course_with_group() -> FetchConfiguration<CourseFetch> {
        FetchConfiguration::Fetch(CourseFetch {
            group: FetchConfiguration::Fetch(GroupFetch::default()),
        })
    }

    /// Course, group and school.
    pub fn course_with_group_and_school() -> FetchConfiguration<CourseFetch> {
        FetchConfiguration::Fetch(CourseFetch {
            group: group_with_school(),
        })
    }

    pub fn group_with_school() -> FetchConfiguration<GroupFetch> {
        FetchConfiguration::Fetch(GroupFetch {
            school: FetchConfiguration::Fetch(()),
        })
    }

    // === Resolvers ===

    pub struct GroupResolver {
        pub schools: Arc<EntitySource<School>>,
    }

    #[async_trait]
    impl RelationResolver<Group> for GroupResolver {
        async fn resolve(&self, mut item: Group, fetch: &GroupFetch) -> Group {
            item.school = resolve_relation(item.school, &fetch.school, &self.schools).await;
            item
        }
    }

    pub struct CourseResolver {
        pub groups: Arc<EntitySource<Group>>,
    }

    #[async_trait]
    impl RelationResolver<Course> for CourseResolver {
        async fn resolve(&self, mut item: Course, fetch: &CourseFetch) -> Course {
            item.group = resolve_relation(item.group, &fetch.group, &self.groups).await;
            item
        }
    }

    // === Sample data ===

    pub fn school_id() -> Uuid {
        Uuid::from_u128(0x0190_0000_0000_7000_8000_0000_0000_0001)
    }

    pub fn sample_school() -> School {
        School::new(school_id(), "Gymnasium Am Markt", "10000000")
    }

    pub fn sample_group() -> Group {
        Group::new(5, "10b", school_id())
    }

    pub fn sample_course() -> Course {
        Course::new(42, "Mathematik", 5)
    }

    /// Short TTL, small capacity.
    pub fn test_config() -> CacheConfig {
        CacheConfig::default()
            .with_max_entries(16)
            .with_ttl(Duration::from_secs(60))
    }

    /// Three sources wired together, each backed by an in-memory store and a
    /// [`MockRemote`] seeded with the sample data.
    pub struct SchoolWorld {
        pub schools: Arc<EntitySource<School>>,
        pub groups: Arc<EntitySource<Group>>,
        pub courses: Arc<EntitySource<Course>>,
        pub school_remote: Arc<MockRemote<School>>,
        pub group_remote: Arc<MockRemote<Group>>,
        pub course_remote: Arc<MockRemote<Course>>,
    }

    impl SchoolWorld {
        pub fn new(config: CacheConfig) -> Self {
            let school_remote =
                Arc::new(MockRemote::new("sp24").with_items([sample_school()]));
            let group_remote = Arc::new(MockRemote::new("vpp").with_items([sample_group()]));
            let course_remote = Arc::new(MockRemote::new("vpp").with_items([sample_course()]));

            let schools: Arc<EntitySource<School>> = Arc::new(EntitySource::in_memory(
                config.clone(),
                school_remote.clone(),
            ));
            let groups: Arc<EntitySource<Group>> = Arc::new(
                EntitySource::in_memory(config.clone(), group_remote.clone()).with_resolver(
                    Arc::new(GroupResolver {
                        schools: Arc::clone(&schools),
                    }),
                ),
            );
            let courses: Arc<EntitySource<Course>> = Arc::new(
                EntitySource::in_memory(config, course_remote.clone()).with_resolver(Arc::new(
                    CourseResolver {
                        groups: Arc::clone(&groups),
                    },
                )),
            );

            Self {
                schools,
                groups,
                courses,
                school_remote,
                group_remote,
                course_remote,
            }
        }

        pub fn shutdown(&self) {
            self.courses.shutdown();
            self.groups.shutdown();
            self.schools.shutdown();
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for results and item states.

    use super::*;

    /// Assert that a VppResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &VppResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a VppResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &VppResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_cancelled<T: std::fmt::Debug>(result: &VppResult<T>) {
        match result {
            Err(VppError::Refresh(RefreshError::Cancelled { .. })) => {}
            other => panic!("Expected cancellation, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_existing<T: std::fmt::Debug>(result: &VppResult<T>) {
        match result {
            Err(VppError::State(StateError::NotExisting { .. })) => {}
            other => panic!("Expected NotExisting, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &VppResult<T>) {
        match result {
            Err(VppError::Fetch(_)) => {}
            other => panic!("Expected Fetch error, got: {:?}", other),
        }
    }

    /// Unwrap a `Done` state.
    #[track_caller]
    pub fn assert_done<I: std::fmt::Debug, T: std::fmt::Debug>(state: ItemState<I, T>) -> T {
        match state {
            ItemState::Done(value) => value,
            other => panic!("Expected Done, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_loaded<T: std::fmt::Debug>(slot: &Cacheable<T>) -> &T {
        match slot {
            Cacheable::Loaded(value) => value,
            other => panic!("Expected Loaded, got: {:?}", other),
        }
    }

    /// Assert that no `Loading` follows a resolved state unless a refresh was
    /// requested in between.
    ///
    /// `observed[i].1` records whether a refresh was requested since the
    /// previous observation.
    #[track_caller]
    pub fn assert_legal_transitions<I, T>(observed: &[(ItemState<I, T>, bool)])
    where
        I: std::fmt::Debug,
        T: std::fmt::Debug,
    {
        for pair in observed.windows(2) {
            let (previous, _) = &pair[0];
            let (next, refreshed) = &pair[1];
            if previous.is_terminal() && next.is_loading() {
                assert!(
                    *refreshed,
                    "Passive revert to Loading after {:?}",
                    previous
                );
            }
            assert!(
                previous.can_transition_to(next, *refreshed),
                "Illegal transition {:?} -> {:?}",
                previous,
                next
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
