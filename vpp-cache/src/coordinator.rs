//! Single-flight refresh coordination.
//!
//! At most one refresh per entity id runs at a time. Callers that arrive while
//! one is in flight await the same shared future and observe the same
//! resolution, value or failure. The registry entry is removed as soon as the
//! refresh finishes, fails or is cancelled, so the next call starts fresh.
//!
//! Each refresh runs on its own tokio task, so it completes and releases its
//! slot even when every caller stops waiting. Dropping an awaiter never
//! cancels a refresh; only [`RefreshCoordinator::cancel_refresh`] and
//! [`RefreshCoordinator::cancel_all`] do. Calls must happen inside a tokio
//! runtime.

use futures_util::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use vpp_core::{RefreshError, VppError, VppResult};

type RefreshFuture<V> = Shared<BoxFuture<'static, VppResult<V>>>;
type Registry<V> = Arc<Mutex<HashMap<String, InFlightRefresh<V>>>>;

/// One outstanding refresh.
struct InFlightRefresh<V> {
    generation: u64,
    result: RefreshFuture<V>,
    abort: AbortHandle,
}

/// A spawned refresh waiting to win registration.
struct Candidate<V> {
    result: RefreshFuture<V>,
    abort: AbortHandle,
    start: oneshot::Sender<()>,
}

impl<V> InFlightRefresh<V> {
    fn cancel(self) {
        self.abort.abort();
    }
}

/// Removes the registry entry when the refresh body finishes or is dropped.
struct RegistryCleanup<V> {
    registry: Registry<V>,
    entity_id: String,
    generation: u64,
}

impl<V> Drop for RegistryCleanup<V> {
    fn drop(&mut self) {
        let removed = match self.registry.lock() {
            Ok(mut map) => match map.get(&self.entity_id) {
                // A newer refresh may already own the slot.
                Some(entry) if entry.generation == self.generation => {
                    map.remove(&self.entity_id)
                }
                _ => None,
            },
            Err(_) => None,
        };
        // Dropped outside the lock: the entry holds a handle to this task.
        drop(removed);
    }
}

/// Deduplicates concurrent refreshes of the same entity.
pub struct RefreshCoordinator<V> {
    in_flight: Registry<V>,
    next_generation: AtomicU64,
}

impl<V> Default for RefreshCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RefreshCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    fn existing(&self, entity_id: &str) -> VppResult<Option<RefreshFuture<V>>> {
        let map = self
            .in_flight
            .lock()
            .map_err(|_| VppError::Refresh(RefreshError::LockPoisoned))?;
        Ok(map.get(entity_id).map(|entry| entry.result.clone()))
    }

    /// Run `refresh_fn` for `entity_id`, or join the refresh already running.
    ///
    /// `refresh_fn` is invoked at most once per in-flight window. It must not
    /// call back into this coordinator for the same id.
    pub async fn coordinate_refresh<F, Fut>(&self, entity_id: &str, refresh_fn: F) -> VppResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = VppResult<V>> + Send + 'static,
    {
        if let Some(pending) = self.existing(entity_id)? {
            trace!(entity_id, "joining in-flight refresh");
            return pending.await;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let candidate = self.spawn_refresh(entity_id, generation, refresh_fn);

        // Double-check under the lock: another caller may have registered
        // between the lookup above and here.
        let (pending, start) = {
            let mut map = self
                .in_flight
                .lock()
                .map_err(|_| VppError::Refresh(RefreshError::LockPoisoned))?;
            match map.get(entity_id) {
                Some(entry) => {
                    drop(candidate);
                    (entry.result.clone(), None)
                }
                None => {
                    let Candidate {
                        result,
                        abort,
                        start,
                    } = candidate;
                    map.insert(
                        entity_id.to_string(),
                        InFlightRefresh {
                            generation,
                            result: result.clone(),
                            abort,
                        },
                    );
                    (result, Some(start))
                }
            }
        };

        match start {
            Some(start) => {
                debug!(entity_id, generation, "starting refresh");
                // The task only exits early if the runtime dropped it.
                let _ = start.send(());
            }
            // The losing task sees its start signal dropped and never runs `refresh_fn`.
            None => debug!(entity_id, "lost registration race, joining winner"),
        }

        pending.await
    }

    /// Spawn a task that runs `refresh_fn` once it is told to start.
    ///
    /// The task finishes and releases the registry slot even if every caller
    /// stops awaiting its result.
    fn spawn_refresh<F, Fut>(&self, entity_id: &str, generation: u64, refresh_fn: F) -> Candidate<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = VppResult<V>> + Send + 'static,
    {
        let (abort, registration) = AbortHandle::new_pair();
        let (start, started) = oneshot::channel::<()>();
        let cleanup = RegistryCleanup {
            registry: Arc::clone(&self.in_flight),
            entity_id: entity_id.to_string(),
            generation,
        };
        let cancelled_id = entity_id.to_string();
        let task = tokio::spawn(async move {
            let _cleanup = cleanup;
            let cancelled = || -> VppResult<V> {
                Err(VppError::Refresh(RefreshError::Cancelled {
                    entity_id: cancelled_id,
                }))
            };
            if started.await.is_err() {
                return cancelled();
            }
            match Abortable::new(async move { refresh_fn().await }, registration).await {
                Ok(result) => result,
                Err(_aborted) => cancelled(),
            }
        });

        let joined_id = entity_id.to_string();
        let result: BoxFuture<'static, VppResult<V>> = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(entity_id = %joined_id, error = %err, "refresh task failed");
                    Err(VppError::Refresh(RefreshError::TaskFailed {
                        entity_id: joined_id,
                        reason: err.to_string(),
                    }))
                }
            }
        }
        .boxed();

        Candidate {
            result: result.shared(),
            abort,
            start,
        }
    }

    /// Whether a refresh for `entity_id` is currently registered.
    pub fn is_refreshing(&self, entity_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|map| map.contains_key(entity_id))
            .unwrap_or(false)
    }

    /// Number of registered refreshes.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Cancel the refresh for one id. Every awaiter observes cancellation.
    ///
    /// Returns whether anything was cancelled.
    pub fn cancel_refresh(&self, entity_id: &str) -> bool {
        let removed = match self.in_flight.lock() {
            Ok(mut map) => map.remove(entity_id),
            Err(_) => None,
        };
        match removed {
            Some(entry) => {
                debug!(entity_id, "cancelling refresh");
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding refresh. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<InFlightRefresh<V>> = match self.in_flight.lock() {
            Ok(mut map) => map.drain().map(|(_, entry)| entry).collect(),
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for entry in drained {
            entry.cancel();
        }
        if count > 0 {
            debug!(count, "cancelled all refreshes");
        }
        count
    }
}

impl<V> std::fmt::Debug for RefreshCoordinator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self.in_flight.lock().map(|map| map.len()).unwrap_or(0);
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &in_flight)
            .finish()
    }
}
