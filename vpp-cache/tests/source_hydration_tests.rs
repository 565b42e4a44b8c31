//! End-to-end tests for EntitySource.
//!
//! Three sources wired School <- Group <- Course, each backed by an in-memory
//! store and a scripted remote. Covers hydration to a fetch configuration,
//! fetch deduplication across subscribers, alias lookup, freshness and
//! write-through failure handling.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use vpp_cache::{
    get_first_value, CacheState, Cacheable, EntitySource, FetchConfiguration, Freshness,
    InMemoryStore, ItemState, StateStreamExt,
};
use vpp_core::{Alias, AliasProvider, DataTags, EntityId, ManualClock, Tagged};
use vpp_test_utils::assertions::{
    assert_done, assert_fetch_error, assert_loaded, assert_not_existing,
};
use vpp_test_utils::fixtures::*;
use vpp_test_utils::{init_tracing, FailingStore, MockRemote};

const WAIT: Duration = Duration::from_secs(5);

/// Next state matching `wanted`, skipping the rest.
async fn next_matching<T, F>(states: &mut BoxStream<'static, CacheState<T>>, wanted: F) -> CacheState<T>
where
    T: std::fmt::Debug,
    F: Fn(&CacheState<T>) -> bool,
{
    let search = async {
        while let Some(state) = states.next().await {
            if wanted(&state) {
                return state;
            }
        }
        panic!("stream ended before the wanted state");
    };
    tokio::time::timeout(WAIT, search)
        .await
        .expect("timed out waiting for state")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .expect("condition never held");
}

// ============================================================================
// HYDRATION
// ============================================================================

#[tokio::test]
async fn test_full_hydration_fetches_each_entity_once() {
    init_tracing();
    let world = SchoolWorld::new(test_config());

    let course = world
        .courses
        .get_first(EntityId::Int(42), course_with_group_and_school())
        .await
        .unwrap();

    assert_eq!(course.subject, "Mathematik");
    let group = assert_loaded(&course.group);
    assert_eq!(group.name, "10b");
    let school = assert_loaded(&group.school);
    assert_eq!(school.name, "Gymnasium Am Markt");

    assert_eq!(world.course_remote.calls(), 1);
    assert_eq!(world.group_remote.calls(), 1);
    assert_eq!(world.school_remote.calls(), 1);
}

#[tokio::test]
async fn test_ignore_leaves_relations_untouched() {
    let world = SchoolWorld::new(test_config());

    let course = world
        .courses
        .get_first(EntityId::Int(42), FetchConfiguration::Ignore)
        .await
        .unwrap();

    assert_eq!(course.group, Cacheable::Uninitialized(EntityId::Int(5)));
    assert_eq!(world.group_remote.calls(), 0);
    assert_eq!(world.school_remote.calls(), 0);
}

#[tokio::test]
async fn test_partial_configuration_stops_at_group() {
    let world = SchoolWorld::new(test_config());

    let course = world
        .courses
        .get_first(EntityId::Int(42), course_with_group())
        .await
        .unwrap();

    let group = assert_loaded(&course.group);
    assert_eq!(
        group.school,
        Cacheable::Uninitialized(EntityId::Surrogate(school_id()))
    );
    assert_eq!(world.school_remote.calls(), 0);
}

#[tokio::test]
async fn test_missing_relation_becomes_not_existing() {
    let world = SchoolWorld::new(test_config());
    world.course_remote.insert(Course::new(43, "Physik", 77));

    let course = world
        .courses
        .get_first(EntityId::Int(43), course_with_group())
        .await
        .unwrap();

    assert_eq!(course.group, Cacheable::NotExisting(EntityId::Int(77)));
    assert!(vpp_cache::is_config_satisfied(&course, &course_with_group(), true));
    assert!(!vpp_cache::is_config_satisfied(&course, &course_with_group(), false));
}

#[tokio::test]
async fn test_failed_relation_becomes_error() {
    let world = SchoolWorld::new(test_config());
    world.group_remote.fail_id(EntityId::Int(5));

    let course = world
        .courses
        .get_first(EntityId::Int(42), course_with_group())
        .await
        .unwrap();

    match &course.group {
        Cacheable::Error { id, cause } => {
            assert_eq!(id, &EntityId::Int(5));
            assert!(!cause.is_cancelled());
        }
        other => panic!("expected Error slot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_subscribers_share_fetches() {
    let world = SchoolWorld::new(test_config());
    world.course_remote.set_latency(Some(Duration::from_millis(20)));
    world.group_remote.set_latency(Some(Duration::from_millis(20)));

    let (a, b, c) = tokio::join!(
        world
            .courses
            .get_first(EntityId::Int(42), course_with_group_and_school()),
        world
            .courses
            .get_first(EntityId::Int(42), course_with_group_and_school()),
        world.groups.get_first(EntityId::Int(5), group_with_school()),
    );

    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(a, b);
    assert_eq!(assert_loaded(&a.group).name, c.name);
    assert_eq!(world.course_remote.calls(), 1);
    assert_eq!(world.group_remote.calls(), 1);
    assert_eq!(world.school_remote.calls(), 1);
}

#[tokio::test]
async fn test_late_subscriber_with_wider_configuration_hydrates_further() {
    let world = SchoolWorld::new(test_config());

    let shallow = world
        .courses
        .get_first(EntityId::Int(42), FetchConfiguration::Ignore)
        .await
        .unwrap();
    assert!(!shallow.group.is_loaded());

    let deep = world
        .courses
        .get_first(EntityId::Int(42), course_with_group_and_school())
        .await
        .unwrap();
    assert!(assert_loaded(&deep.group).school.is_loaded());
    assert_eq!(world.course_remote.calls(), 1);
}

// ============================================================================
// ALIASES
// ============================================================================

#[tokio::test]
async fn test_alias_is_fetched_once_then_resolved_locally() {
    let world = SchoolWorld::new(test_config());
    let alias = Alias::new(AliasProvider::Sp24, "10000000", 1);

    let mut states = world
        .schools
        .get_by_alias(alias.clone(), FetchConfiguration::Ignore);
    assert_eq!(states.next().await, Some(ItemState::Loading(alias.clone())));
    let school = assert_done(states.next().await.expect("alias stream ended"));
    assert_eq!(school.id, school_id());
    assert_eq!(world.school_remote.alias_calls(), 1);

    // A newer version of the same alias resolves without the remote.
    let newer = Alias::new(AliasProvider::Sp24, "10000000", 2);
    assert_eq!(
        world.schools.resolve_alias(&newer),
        Some(EntityId::Surrogate(school_id()))
    );
    let again = world
        .schools
        .get_by_alias(newer, FetchConfiguration::Ignore)
        .get_first_value(DataTags::empty())
        .await
        .unwrap();
    assert_eq!(again.name, school.name);
    assert_eq!(world.school_remote.alias_calls(), 1);
    assert_eq!(world.school_remote.calls(), 0);
}

#[tokio::test]
async fn test_unknown_alias_is_not_existing() {
    let world = SchoolWorld::new(test_config());
    let alias = Alias::new(AliasProvider::Sp24, "99999999", 1);

    let result = world
        .schools
        .get_by_alias(alias, FetchConfiguration::Ignore)
        .get_first_value(DataTags::empty())
        .await;
    assert_not_existing(&result);
}

// ============================================================================
// REFRESH AND CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_refresh_publishes_new_value() {
    let world = SchoolWorld::new(test_config());
    let id = EntityId::Int(42);
    world
        .courses
        .get_first(id.clone(), FetchConfiguration::Ignore)
        .await
        .unwrap();

    let mut states = world.courses.get(id.clone(), FetchConfiguration::Ignore);
    world.course_remote.insert(Course::new(42, "Mathematik LK", 5));

    let refreshed = world.courses.refresh(id).await.unwrap().unwrap();
    assert_eq!(refreshed.subject, "Mathematik LK");

    let seen = next_matching(&mut states, |state| {
        matches!(state, ItemState::Done(course) if course.subject == "Mathematik LK")
    })
    .await;
    assert!(assert_done(seen).has_tags(DataTags::REMOTE));
    assert_eq!(world.course_remote.calls(), 2);
}

#[tokio::test]
async fn test_refresh_of_vanished_entity_publishes_not_existing() {
    let world = SchoolWorld::new(test_config());
    let id = EntityId::Int(5);
    world
        .groups
        .get_first(id.clone(), FetchConfiguration::Ignore)
        .await
        .unwrap();

    world.group_remote.remove(&id);
    assert_eq!(world.groups.refresh(id.clone()).await.unwrap(), None);
    assert!(!world.groups.cache().contains(&id));

    let result = world.groups.get_first(id, FetchConfiguration::Ignore).await;
    assert_not_existing(&result);
}

#[tokio::test]
async fn test_abandoned_refresh_still_publishes_and_caches() {
    let world = SchoolWorld::new(test_config());
    let id = EntityId::Int(42);
    world
        .courses
        .get_first(id.clone(), FetchConfiguration::Ignore)
        .await
        .unwrap();

    let mut states = world.courses.get(id.clone(), FetchConfiguration::Ignore);
    world.course_remote.insert(Course::new(42, "Mathematik LK", 5));
    world.course_remote.set_latency(Some(Duration::from_millis(50)));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(5), world.courses.refresh(id.clone())).await;
    assert!(abandoned.is_err());

    next_matching(&mut states, |state| {
        matches!(state, ItemState::Done(course) if course.subject == "Mathematik LK")
    })
    .await;
    wait_until(|| !world.courses.is_refreshing(&id)).await;

    let cached = world.courses.cache().get(&id).expect("refreshed value not cached");
    assert_eq!(cached.subject, "Mathematik LK");
    assert_eq!(world.course_remote.calls(), 2);
}

#[tokio::test]
async fn test_cancel_surfaces_cancellation_to_subscribers() {
    let world = SchoolWorld::new(test_config());
    world.group_remote.set_latency(Some(Duration::from_secs(5)));
    let id = EntityId::Int(5);

    let mut states = world.groups.get(id.clone(), FetchConfiguration::Ignore);
    wait_until(|| world.group_remote.calls() == 1).await;
    assert!(world.groups.is_refreshing(&id));
    assert!(world.groups.cancel(&id));

    match next_matching(&mut states, |state| !state.is_loading()).await {
        ItemState::Error(failed, cause) => {
            assert_eq!(failed, id);
            assert!(cause.is_cancelled());
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_ends_streams() {
    let world = SchoolWorld::new(test_config());
    let mut states = world.courses.get(EntityId::Int(42), FetchConfiguration::Ignore);
    next_matching(&mut states, |state| state.is_terminal()).await;

    world.shutdown();
    assert_eq!(world.courses.stream_count(), 0);

    let drained = tokio::time::timeout(WAIT, async {
        while states.next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "stream kept running after shutdown");
}

// ============================================================================
// LOCAL STORE
// ============================================================================

#[tokio::test]
async fn test_write_through_failure_still_serves_remote_value() {
    init_tracing();
    let store = Arc::new(FailingStore::write_only_failures());
    let remote = Arc::new(MockRemote::new("vpp").with_items([sample_group()]));
    let groups = Arc::new(EntitySource::<Group>::new(
        test_config(),
        store.clone(),
        remote.clone(),
    ));

    let group = groups
        .get_first(EntityId::Int(5), FetchConfiguration::Ignore)
        .await
        .unwrap();

    assert_eq!(group.tags(), DataTags::REMOTE);
    assert_eq!(store.write_attempts(), 1);
    assert_eq!(remote.calls(), 1);
}

#[tokio::test]
async fn test_store_read_failure_falls_back_to_remote() {
    let store = Arc::new(FailingStore::all_failures());
    let remote = Arc::new(MockRemote::new("vpp").with_items([sample_group()]));
    let groups = Arc::new(EntitySource::<Group>::new(
        test_config(),
        store.clone(),
        remote.clone(),
    ));

    let group = groups
        .get_first(EntityId::Int(5), FetchConfiguration::Ignore)
        .await
        .unwrap();
    assert_eq!(group.name, "10b");
    assert_eq!(remote.calls(), 1);
}

#[tokio::test]
async fn test_remote_failure_without_local_copy_is_error() {
    let world = SchoolWorld::new(test_config());
    world.group_remote.fail_id(EntityId::Int(5));

    let result = world
        .groups
        .get_first(EntityId::Int(5), FetchConfiguration::Ignore)
        .await;
    assert_fetch_error(&result);
}

#[tokio::test]
async fn test_vanished_entity_is_not_resurrected_from_store() {
    let store = Arc::new(InMemoryStore::with_items([sample_group()]));
    let remote = Arc::new(MockRemote::<Group>::new("vpp"));
    let groups = Arc::new(EntitySource::<Group>::new(
        test_config(),
        store.clone(),
        remote.clone(),
    ));
    let id = EntityId::Int(5);

    assert_eq!(groups.refresh(id.clone()).await.unwrap(), None);
    assert_eq!(groups.prune_idle_streams(), 1);

    let result = groups.get_first(id.clone(), FetchConfiguration::Ignore).await;
    assert_not_existing(&result);
    assert_eq!(store.read_count(), 0);
    assert_eq!(remote.calls(), 2);

    remote.insert(Group::new(5, "10c", school_id()));
    let revived = groups.refresh(id).await.unwrap().unwrap();
    assert_eq!(revived.name, "10c");
}

#[tokio::test]
async fn test_cold_start_serves_local_copy_without_remote() {
    let store = Arc::new(InMemoryStore::with_items([sample_group()]));
    let remote = Arc::new(MockRemote::<Group>::new("vpp"));
    let groups = Arc::new(EntitySource::<Group>::new(
        test_config(),
        store.clone(),
        remote.clone(),
    ));

    let group = groups
        .get_first(EntityId::Int(5), FetchConfiguration::Ignore)
        .await
        .unwrap();

    assert_eq!(group.tags(), DataTags::LOCAL);
    assert_eq!(remote.calls(), 0);
    assert_eq!(store.read_count(), 1);
}

// ============================================================================
// FRESHNESS
// ============================================================================

#[tokio::test]
async fn test_consistent_read_confirms_local_copy_remotely() {
    let store = Arc::new(InMemoryStore::with_items([sample_group()]));
    let remote = Arc::new(MockRemote::new("vpp").with_items([Group::new(5, "10c", school_id())]));
    let groups = Arc::new(EntitySource::<Group>::new(
        test_config(),
        store.clone(),
        remote.clone(),
    ));

    let states = groups.get_with(
        EntityId::Int(5),
        FetchConfiguration::Ignore,
        Freshness::consistent(),
    );
    let group = get_first_value(states, DataTags::REMOTE).await.unwrap();

    assert_eq!(group.name, "10c");
    assert!(group.has_tags(DataTags::LOCAL | DataTags::REMOTE));
    assert_eq!(remote.calls(), 1);
    assert_eq!(store.get(&EntityId::Int(5)).await.unwrap().name, "10c");
}

#[tokio::test]
async fn test_best_effort_refreshes_only_stale_values() {
    let clock = Arc::new(ManualClock::starting_now());
    let remote = Arc::new(MockRemote::new("vpp").with_items([sample_group()]));
    let config = test_config().with_ttl(Duration::from_secs(3600));
    let groups = Arc::new(
        EntitySource::<Group>::in_memory(config, remote.clone()).with_clock(clock.clone()),
    );
    let id = EntityId::Int(5);

    groups
        .get_first(id.clone(), FetchConfiguration::Ignore)
        .await
        .unwrap();
    assert_eq!(remote.calls(), 1);

    // Within the allowed staleness: served as is.
    clock.advance(Duration::from_secs(2));
    let states = groups.get_with(
        id.clone(),
        FetchConfiguration::Ignore,
        Freshness::best_effort(Duration::from_secs(5)),
    );
    drop(states);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(remote.calls(), 1);

    // Past it: the held value is served and confirmed in the background.
    clock.advance(Duration::from_secs(10));
    let mut states = groups.get_with(
        id.clone(),
        FetchConfiguration::Ignore,
        Freshness::best_effort(Duration::from_secs(5)),
    );
    assert!(matches!(states.next().await, Some(ItemState::Done(_))));
    wait_until(|| remote.calls() == 2 && !groups.is_refreshing(&id)).await;
}

#[tokio::test]
async fn test_expired_value_is_rederived_from_store() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::new());
    let remote = Arc::new(MockRemote::new("vpp").with_items([sample_group()]));
    let groups = Arc::new(
        EntitySource::<Group>::new(test_config(), store.clone(), remote.clone())
            .with_clock(clock.clone()),
    );
    let id = EntityId::Int(5);

    let first = groups
        .get_first(id.clone(), FetchConfiguration::Ignore)
        .await
        .unwrap();
    assert!(first.has_tags(DataTags::REMOTE));

    clock.advance(Duration::from_secs(61));
    assert_eq!(groups.cache().get(&id), None);

    let mut states = groups.get(id.clone(), FetchConfiguration::Ignore);
    let reloaded = next_matching(&mut states, |state| {
        matches!(state, ItemState::Done(group) if group.tags() == DataTags::LOCAL)
    })
    .await;

    assert_eq!(assert_done(reloaded).name, "10b");
    assert_eq!(remote.calls(), 1);
    assert_eq!(store.read_count(), 2);
}

#[tokio::test]
async fn test_invalidate_keeps_subscribers_on_last_state() {
    let world = SchoolWorld::new(test_config());
    let id = EntityId::Int(5);
    let mut states = world.groups.get(id.clone(), FetchConfiguration::Ignore);
    next_matching(&mut states, |state| state.is_terminal()).await;

    assert!(world.groups.invalidate(&id));
    assert!(!world.groups.invalidate(&id));
    assert!(!world.groups.cache().contains(&id));

    let polled = tokio::time::timeout(Duration::from_millis(50), states.next()).await;
    assert!(polled.is_err(), "invalidate must not emit a state");
}
