//! Garbage collector: evicts entries nobody has watched for a while.
//!
//! An entry becomes eligible once its last subscriber leaves and the idle
//! retention window has elapsed on the store's clock. Entries with a fetch
//! in flight are never evicted, whatever their idle age. Eviction removes the
//! entry entirely; the next subscription starts from `Idle`.

use crate::key::CacheKey;
use crate::observability::SyncMetrics;
use crate::store::EntryStore;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

impl<V> EntryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Evict every unwatched entry idle for at least `retention`.
    ///
    /// Returns the evicted keys in canonical order.
    pub fn sweep(&self, retention: Duration) -> Vec<CacheKey> {
        let now = self.now();
        let mut evicted = Vec::new();

        self.entries.retain(|key, slot| {
            let expired = slot.listeners.is_empty()
                && slot.in_flight.is_none()
                && slot
                    .idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= retention);
            if expired {
                evicted.push(key.clone());
            }
            !expired
        });

        evicted.sort();
        if !evicted.is_empty() {
            debug!("✓ Swept {} idle entries ({} left)", evicted.len(), self.len());
        }
        evicted
    }
}

/// Shortest interval a collector sweeps at.
pub const MIN_COLLECT_INTERVAL: Duration = Duration::from_secs(1);

/// Run [`EntryStore::sweep`] every `interval` on the current tokio runtime.
///
/// Intervals below [`MIN_COLLECT_INTERVAL`] are raised to it. The task holds
/// only a weak reference and exits on the first tick after the store is
/// dropped. Abort the returned handle to stop it earlier.
pub fn spawn_collector<V>(
    store: Weak<EntryStore<V>>,
    retention: Duration,
    interval: Duration,
    metrics: Arc<dyn SyncMetrics>,
) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    let interval = if interval < MIN_COLLECT_INTERVAL {
        warn!(
            "Collector interval {:?} is below {:?}, using the minimum",
            interval, MIN_COLLECT_INTERVAL
        );
        MIN_COLLECT_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                debug!("Store dropped, collector exiting");
                break;
            };
            for key in store.sweep(retention) {
                metrics.record_evict(&key);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::EntryStatus;
    use crate::observability::NoOpMetrics;
    use futures::FutureExt;

    const RETENTION: Duration = Duration::from_secs(300);

    fn store_with_clock() -> (Arc<EntryStore<u32>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(EntryStore::new(clock.clone(), Duration::from_secs(60)));
        (store, clock)
    }

    fn key(resource: &str) -> CacheKey {
        CacheKey::resource(resource).unwrap()
    }

    #[test]
    fn test_sweep_respects_retention_window() {
        let (store, clock) = store_with_clock();
        store.write(&key("controls"), Ok(1));

        clock.advance(RETENTION - Duration::from_secs(1));
        assert!(store.sweep(RETENTION).is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.sweep(RETENTION), vec![key("controls")]);
        assert!(!store.contains(&key("controls")));
    }

    #[test]
    fn test_sweep_keeps_watched_entries() {
        let (store, clock) = store_with_clock();
        let _sub = store.subscribe(&key("risks"), |_| {});
        store.write(&key("risks"), Ok(1));

        clock.advance(RETENTION * 2);
        assert!(store.sweep(RETENTION).is_empty());
        assert!(store.contains(&key("risks")));
    }

    #[test]
    fn test_idle_clock_starts_at_last_unsubscribe() {
        let (store, clock) = store_with_clock();
        let sub = store.subscribe(&key("audits"), |_| {});

        clock.advance(RETENTION * 3);
        drop(sub);
        assert!(store.sweep(RETENTION).is_empty());

        clock.advance(RETENTION);
        assert_eq!(store.sweep(RETENTION).len(), 1);
    }

    #[test]
    fn test_sweep_skips_in_flight_fetch() {
        let (store, clock) = store_with_clock();
        let k = key("evidence");
        let pending = futures::future::pending::<crate::Result<u32>>()
            .boxed()
            .shared();
        let (_fetch, started) = store.begin_fetch(&k, |_, _| pending);
        assert!(started);

        clock.advance(RETENTION * 10);
        assert!(store.sweep(RETENTION).is_empty());
        assert_eq!(store.get_snapshot(&k).status, EntryStatus::Loading);
    }

    #[test]
    fn test_evicted_entry_restarts_idle() {
        let (store, clock) = store_with_clock();
        store.write(&key("personnel"), Ok(8));
        clock.advance(RETENTION);
        store.sweep(RETENTION);

        let snapshot = store.get_snapshot(&key("personnel"));
        assert_eq!(snapshot.status, EntryStatus::Idle);
        assert!(snapshot.value.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_sweeps_periodically() {
        let (store, clock) = store_with_clock();
        store.write(&key("controls"), Ok(1));
        clock.advance(RETENTION);

        let handle = spawn_collector(
            Arc::downgrade(&store),
            RETENTION,
            Duration::from_secs(30),
            Arc::new(NoOpMetrics),
        );
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(store.is_empty());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_exits_when_store_dropped() {
        let (store, _clock) = store_with_clock();
        let handle = spawn_collector(
            Arc::downgrade(&store),
            RETENTION,
            Duration::from_secs(30),
            Arc::new(NoOpMetrics),
        );
        drop(store);

        let finished = tokio::time::timeout(Duration::from_secs(120), handle).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_uses_minimum() {
        let (store, clock) = store_with_clock();
        store.write(&key("controls"), Ok(1));
        clock.advance(RETENTION);

        let handle = spawn_collector(
            Arc::downgrade(&store),
            RETENTION,
            Duration::ZERO,
            Arc::new(NoOpMetrics),
        );
        tokio::time::sleep(MIN_COLLECT_INTERVAL / 2).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(MIN_COLLECT_INTERVAL).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
