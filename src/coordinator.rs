//! Fetch coordinator: single-flight fetching with bounded retry.
//!
//! At most one fetch runs per key. The first caller starts it, every later
//! caller joins the same shared future until it settles. The fetch is spawned
//! on the tokio runtime, so it makes progress whether or not anyone awaits the
//! returned [`FetchHandle`], and dropping a handle never cancels it.

use crate::config::{RetryPolicy, SyncConfig};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::key::CacheKey;
use crate::observability::SyncMetrics;
use crate::store::{EntryStore, Settled, SharedFetch};
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Awaitable handle on the in-flight fetch of one key.
///
/// Cheap to clone; every clone resolves to the same outcome.
#[derive(Clone)]
#[must_use = "a FetchHandle does nothing unless awaited; inside a runtime the fetch runs anyway"]
pub struct FetchHandle<V> {
    key: CacheKey,
    fetch: SharedFetch<V>,
    joined: bool,
}

impl<V> FetchHandle<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// `true` if this handle joined a fetch that was already running.
    pub fn joined(&self) -> bool {
        self.joined
    }
}

impl<V> Future for FetchHandle<V>
where
    V: Clone,
{
    type Output = Result<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.fetch).poll(cx)
    }
}

impl<V> std::fmt::Debug for FetchHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle")
            .field("key", &self.key)
            .field("joined", &self.joined)
            .finish()
    }
}

/// Runs fetches against the entry store.
pub struct FetchCoordinator<V> {
    store: Arc<EntryStore<V>>,
    retry: RetryPolicy,
    fetch_timeout: Option<Duration>,
    metrics: Arc<dyn SyncMetrics>,
}

impl<V> FetchCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<EntryStore<V>>, config: &SyncConfig, metrics: Arc<dyn SyncMetrics>) -> Self {
        FetchCoordinator {
            store,
            retry: config.retry.clone(),
            fetch_timeout: config.fetch_timeout,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<EntryStore<V>> {
        &self.store
    }

    /// Make sure a fetch for `key` is running and return a handle on it.
    ///
    /// If one is already in flight the existing handle is returned and
    /// `fetcher` is not called. Otherwise the entry moves to `Loading` (no
    /// value yet) or `Refreshing`, and a new fetch is spawned on the current
    /// tokio runtime.
    ///
    /// On success the value is written to the store. On failure the error
    /// is written after `RetryPolicy::max_retries` retries, and any cached
    /// value is kept. If the key is invalidated while the fetch runs and
    /// somebody is subscribed, the fetch goes again and the handle resolves
    /// to the newer outcome.
    ///
    /// Outside a runtime an already running fetch is still joined, but nothing
    /// new is registered on the entry: the handle runs its own fetch when
    /// awaited and writes the outcome, and dropping it unawaited leaves the
    /// entry untouched. A configured `fetch_timeout` needs a runtime to await.
    pub fn ensure_fetch(&self, key: &CacheKey, fetcher: Arc<dyn Fetcher<V>>) -> FetchHandle<V> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                if let Some(running) = self.in_flight(key) {
                    return running;
                }
                warn!(
                    "No tokio runtime: fetch for {} runs only when its handle is awaited",
                    key
                );
                let fetch = run_fetch(
                    Arc::downgrade(&self.store),
                    key.clone(),
                    fetcher,
                    self.retry.clone(),
                    self.fetch_timeout,
                    Arc::clone(&self.metrics),
                    UNREGISTERED,
                    self.store.generation(key),
                )
                .boxed()
                .shared();
                return FetchHandle {
                    key: key.clone(),
                    fetch,
                    joined: false,
                };
            }
        };

        let (fetch, started) = self.store.begin_fetch(key, |fetch_id, generation| {
            run_fetch(
                Arc::downgrade(&self.store),
                key.clone(),
                fetcher,
                self.retry.clone(),
                self.fetch_timeout,
                Arc::clone(&self.metrics),
                fetch_id,
                generation,
            )
            .boxed()
            .shared()
        });

        if started {
            debug!("» Fetch started for {}", key);
            runtime.spawn(fetch.clone());
        } else {
            debug!("Joined in-flight fetch for {}", key);
        }

        FetchHandle {
            key: key.clone(),
            fetch,
            joined: !started,
        }
    }

    /// Handle on the fetch currently running for `key`, if any.
    pub fn in_flight(&self, key: &CacheKey) -> Option<FetchHandle<V>> {
        self.store.in_flight(key).map(|fetch| FetchHandle {
            key: key.clone(),
            fetch,
            joined: true,
        })
    }
}

impl<V> Clone for FetchCoordinator<V> {
    fn clone(&self) -> Self {
        FetchCoordinator {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
            fetch_timeout: self.fetch_timeout,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Fetch id of a fetch that owns no in-flight marker. Store ids start at 1.
const UNREGISTERED: u64 = 0;

#[allow(clippy::too_many_arguments)]
async fn run_fetch<V>(
    store: Weak<EntryStore<V>>,
    key: CacheKey,
    fetcher: Arc<dyn Fetcher<V>>,
    retry: RetryPolicy,
    fetch_timeout: Option<Duration>,
    metrics: Arc<dyn SyncMetrics>,
    fetch_id: u64,
    mut generation: u64,
) -> Result<V>
where
    V: Clone + Send + Sync + 'static,
{
    loop {
        let outcome = fetch_with_retry(
            &key,
            fetcher.as_ref(),
            &retry,
            fetch_timeout,
            metrics.as_ref(),
        )
        .await;

        let Some(store) = store.upgrade() else {
            debug!("Store dropped before fetch for {} settled", key);
            return outcome;
        };
        match store.complete_fetch(&key, fetch_id, generation, outcome.clone()) {
            Settled::Done => return outcome,
            Settled::Refetch(current) => {
                debug!("{} was invalidated mid-flight, fetching again", key);
                generation = current;
            }
        }
    }
}

async fn fetch_with_retry<V>(
    key: &CacheKey,
    fetcher: &dyn Fetcher<V>,
    retry: &RetryPolicy,
    fetch_timeout: Option<Duration>,
    metrics: &dyn SyncMetrics,
) -> Result<V> {
    let timer = Instant::now();
    let mut attempts = 0;
    let max_attempts = retry.max_retries + 1; // +1 for initial attempt

    let outcome = loop {
        attempts += 1;

        let result = match fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetcher.fetch(key)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "fetch of {} exceeded {:?}",
                    key, limit
                ))),
            },
            None => fetcher.fetch(key).await,
        };

        match result {
            Ok(value) => break Ok(value),
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                debug!(
                    "Fetch for {} failed (attempt {}/{}): {}, retrying...",
                    key, attempts, max_attempts, e
                );
                let delay = retry.delay_for(attempts);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => break Err(e),
        }
    };

    match &outcome {
        Ok(_) => {
            metrics.record_fetch(key, timer.elapsed());
            info!("✓ Fetch for {} succeeded in {:?}", key, timer.elapsed());
        }
        Err(e) => metrics.record_error(key, &e.to_string()),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::EntryStatus;
    use crate::key::KeyPrefix;
    use crate::observability::NoOpMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn setup(config: SyncConfig) -> FetchCoordinator<u32> {
        let store = Arc::new(EntryStore::new(
            Arc::new(ManualClock::new()),
            Duration::from_secs(60),
        ));
        FetchCoordinator::new(store, &config, Arc::new(NoOpMetrics))
    }

    fn no_backoff() -> SyncConfig {
        SyncConfig::default().with_retry(RetryPolicy::default().with_base_delay(Duration::ZERO))
    }

    fn counting_fetcher(calls: Arc<AtomicUsize>, value: u32) -> Arc<dyn Fetcher<u32>> {
        Arc::new(move |_key: CacheKey| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(value)
            }
        })
    }

    /// Fetcher that counts calls and waits for `gate` on the first one.
    fn gated_fetcher(gate: Arc<Notify>, calls: Arc<AtomicUsize>) -> Arc<dyn Fetcher<u32>> {
        Arc::new(move |_key: CacheKey| {
            let gate = gate.clone();
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                if call == 1 {
                    gate.notified().await;
                }
                Ok::<_, Error>(call)
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("controls").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let fetcher: Arc<dyn Fetcher<u32>> = {
            let calls = calls.clone();
            let gate = gate.clone();
            Arc::new(move |_key: CacheKey| {
                let calls = calls.clone();
                let gate = gate.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok::<_, Error>(50u32)
                }
            })
        };

        let handles: Vec<_> = (0..8)
            .map(|_| coordinator.ensure_fetch(&key, fetcher.clone()))
            .collect();
        assert!(!handles[0].joined());
        assert!(handles[1..].iter().all(|h| h.joined()));

        tokio::task::yield_now().await;
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await, Ok(50));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.in_flight(&key).is_none());
    }

    #[tokio::test]
    async fn test_success_is_written_to_store() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("risks").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let value = coordinator
            .ensure_fetch(&key, counting_fetcher(calls, 7))
            .await
            .unwrap();

        assert_eq!(value, 7);
        let snapshot = coordinator.store().get_snapshot(&key);
        assert_eq!(snapshot.value, Some(7));
        assert_eq!(snapshot.status, EntryStatus::Fresh);
        assert!(!snapshot.in_flight);
    }

    #[tokio::test]
    async fn test_retries_exactly_once_by_default() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("integrations").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let fetcher: Arc<dyn Fetcher<u32>> = Arc::new(move |_key: CacheKey| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(Error::FetchError("401 Unauthorized".into()))
            }
        });

        let result = coordinator.ensure_fetch(&key, fetcher).await;
        assert_eq!(result, Err(Error::FetchError("401 Unauthorized".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let snapshot = coordinator.store().get_snapshot(&key);
        assert_eq!(snapshot.status, EntryStatus::Failed);
        assert!(snapshot.is_blocking_error());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_one_failure() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("audits").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let fetcher: Arc<dyn Fetcher<u32>> = Arc::new(move |_key: CacheKey| {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::FetchError("connection reset".into()))
                } else {
                    Ok(3u32)
                }
            }
        });

        assert_eq!(coordinator.ensure_fetch(&key, fetcher).await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_cached_value() {
        let coordinator = setup(SyncConfig::default().with_retry(RetryPolicy::none()));
        let key = CacheKey::resource("controls").unwrap();
        coordinator.store().write(&key, Ok(50));

        let failing: Arc<dyn Fetcher<u32>> = Arc::new(|_key: CacheKey| async move {
            Err::<u32, _>(Error::FetchError("503".into()))
        });
        let result = coordinator.ensure_fetch(&key, failing).await;
        assert!(result.is_err());

        let snapshot = coordinator.store().get_snapshot(&key);
        assert_eq!(snapshot.value, Some(50));
        assert_eq!(snapshot.status, EntryStatus::Failed);
        assert_eq!(snapshot.error, Some(Error::FetchError("503".into())));
    }

    #[tokio::test]
    async fn test_refresh_marks_entry_refreshing() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("controls").unwrap();
        coordinator.store().write(&key, Ok(50));
        let gate = Arc::new(Notify::new());
        let gate_clone = gate.clone();

        let fetcher: Arc<dyn Fetcher<u32>> = Arc::new(move |_key: CacheKey| {
            let gate = gate_clone.clone();
            async move {
                gate.notified().await;
                Ok::<_, Error>(52u32)
            }
        });

        let handle = coordinator.ensure_fetch(&key, fetcher);
        let during = coordinator.store().get_snapshot(&key);
        assert_eq!(during.status, EntryStatus::Refreshing);
        assert_eq!(during.value, Some(50));

        gate.notify_one();
        assert_eq!(handle.await, Ok(52));
        assert_eq!(coordinator.store().get_snapshot(&key).value, Some(52));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_takes_retry_path() {
        let config = SyncConfig::default()
            .with_retry(RetryPolicy::none())
            .with_fetch_timeout(Duration::from_secs(5));
        let coordinator = setup(config);
        let key = CacheKey::resource("evidence").unwrap();

        let hanging: Arc<dyn Fetcher<u32>> = Arc::new(|_key: CacheKey| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Error>(1u32)
        });

        let result = coordinator.ensure_fetch(&key, hanging).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(
            coordinator.store().get_snapshot(&key).status,
            EntryStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel_fetch() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("personnel").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        drop(coordinator.ensure_fetch(&key, counting_fetcher(calls.clone(), 4)));

        for _ in 0..10 {
            if coordinator.store().get_snapshot(&key).value.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.store().get_snapshot(&key).value, Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidated_fetch_lands_stale() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("risks").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let handle = coordinator.ensure_fetch(&key, gated_fetcher(gate.clone(), calls.clone()));
        let report = coordinator.store().invalidate(&KeyPrefix::resource("risks"));
        assert_eq!(report.matched, vec![key.clone()]);

        gate.notify_one();
        assert_eq!(handle.await, Ok(1));

        let snapshot = coordinator.store().get_snapshot(&key);
        assert_eq!(snapshot.status, EntryStatus::Stale);
        assert_eq!(snapshot.value, Some(1));
        assert!(!snapshot.in_flight);
        // Nobody watches the entry, so it waits for the next read
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watched_fetch_goes_again_after_invalidation() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("risks").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = coordinator.store().subscribe(&key, move |entry| {
            seen_clone.lock().unwrap().push((entry.status, entry.value));
        });
        let handle = coordinator.ensure_fetch(&key, gated_fetcher(gate.clone(), calls.clone()));
        let _ = coordinator.store().invalidate(&KeyPrefix::resource("risks"));

        gate.notify_one();
        assert_eq!(handle.await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let snapshot = coordinator.store().get_snapshot(&key);
        assert_eq!(snapshot.status, EntryStatus::Fresh);
        assert_eq!(snapshot.value, Some(2));
        assert!(!snapshot.in_flight);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (EntryStatus::Idle, None),
                (EntryStatus::Refreshing, Some(1)),
                (EntryStatus::Fresh, Some(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_superseded_fetch_keeps_newer_marker() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("controls").unwrap();
        let first_gate = Arc::new(Notify::new());
        let second_gate = Arc::new(Notify::new());

        let first = coordinator.ensure_fetch(
            &key,
            gated_fetcher(first_gate.clone(), Arc::new(AtomicUsize::new(0))),
        );
        // A direct write drops the marker of the running fetch
        coordinator.store().write(&key, Ok(50));
        assert!(coordinator.in_flight(&key).is_none());

        let second = coordinator.ensure_fetch(
            &key,
            gated_fetcher(second_gate.clone(), Arc::new(AtomicUsize::new(0))),
        );
        assert!(!second.joined());

        first_gate.notify_one();
        assert_eq!(first.await, Ok(1));

        let snapshot = coordinator.store().get_snapshot(&key);
        assert!(snapshot.in_flight);
        assert!(coordinator.in_flight(&key).is_some());
        assert_eq!(snapshot.status, EntryStatus::Refreshing);
        assert_eq!(snapshot.value, Some(1));

        second_gate.notify_one();
        assert_eq!(second.await, Ok(1));
        let snapshot = coordinator.store().get_snapshot(&key);
        assert!(!snapshot.in_flight);
        assert_eq!(snapshot.status, EntryStatus::Fresh);
    }

    #[test]
    fn test_without_runtime_nothing_is_registered() {
        let coordinator = setup(no_backoff());
        let key = CacheKey::resource("vendors").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        drop(coordinator.ensure_fetch(&key, counting_fetcher(calls.clone(), 4)));
        assert!(!coordinator.store().contains(&key));
        assert!(coordinator.in_flight(&key).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let handle = coordinator.ensure_fetch(&key, counting_fetcher(calls.clone(), 4));
        assert_eq!(futures::executor::block_on(handle), Ok(4));

        let snapshot = coordinator.store().get_snapshot(&key);
        assert_eq!(snapshot.status, EntryStatus::Fresh);
        assert_eq!(snapshot.value, Some(4));
        assert!(!snapshot.in_flight);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
