//! Stale Entry Sweeper
//!
//! Reads already drop expired entries lazily. The sweeper additionally purges
//! entries nobody reads any more, so an idle cache does not hold on to
//! expired values until the next access. Entity sources also drop per-id
//! streams nobody subscribes to when `prune_idle_streams` is enabled.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use vpp_core::CacheConfig;

use crate::intelligent::IntelligentCache;

/// Something with periodic housekeeping.
pub trait Sweep: Send + Sync + 'static {
    /// Run one housekeeping pass. Returns how many cache entries were removed.
    fn sweep(&self) -> usize;
}

impl<K, V> Sweep for IntelligentCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self.evict_stale()
    }
}

/// Counters for sweeper activity.
#[derive(Debug, Default)]
pub struct SweeperMetrics {
    /// Completed sweep cycles
    pub sweeps: AtomicU64,
    /// Entries removed across all sweeps
    pub entries_removed: AtomicU64,
}

impl SweeperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SweeperSnapshot {
        SweeperSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweeper metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperSnapshot {
    pub sweeps: u64,
    pub entries_removed: u64,
}

/// Run [`Sweep::sweep`] every `every` until `shutdown_rx` flips to `true` or
/// its sender is dropped. A zero `every` runs at the default sweep interval.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let sweeper = spawn_stale_sweeper(Arc::clone(&source), config.sweep_interval, shutdown_rx);
///
/// // Later
/// let _ = shutdown_tx.send(true);
/// let metrics = sweeper.await?;
/// ```
pub async fn stale_sweeper_task<S: Sweep>(
    target: Arc<S>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweeperMetrics> {
    let metrics = Arc::new(SweeperMetrics::new());

    let every = if every.is_zero() {
        let fallback = CacheConfig::default().sweep_interval;
        tracing::warn!(
            fallback_ms = fallback.as_millis() as u64,
            "Zero sweep interval, using default"
        );
        fallback
    } else {
        every
    };
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = every.as_millis() as u64,
        "Stale sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Stale sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let removed = target.sweep();
                metrics.sweeps.fetch_add(1, Ordering::Relaxed);
                metrics
                    .entries_removed
                    .fetch_add(removed as u64, Ordering::Relaxed);
                if removed > 0 {
                    tracing::debug!(removed, "Swept stale entries");
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        entries_removed = snapshot.entries_removed,
        "Stale sweeper completed"
    );

    metrics
}

/// Spawn [`stale_sweeper_task`] on the current runtime.
pub fn spawn_stale_sweeper<S: Sweep>(
    target: Arc<S>,
    every: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Arc<SweeperMetrics>> {
    tokio::spawn(stale_sweeper_task(target, every, shutdown_rx))
}
