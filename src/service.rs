//! Client facade tying the store, policy, coordinator, invalidation and
//! collector together.
//!
//! [`SyncClient`] is an `Arc` around shared state, so clones are cheap and
//! every clone sees the same cache.

use crate::clock::{Clock, SystemClock};
use crate::config::{ResourceConfig, SyncConfig};
use crate::coordinator::{FetchCoordinator, FetchHandle};
use crate::entry::{CacheEntry, EntryStatus};
use crate::error::{Error, Result};
use crate::gc;
use crate::invalidation::{Invalidation, InvalidationMode};
use crate::key::{CacheKey, KeyPrefix};
use crate::observability::{NoOpMetrics, SyncMetrics};
use crate::policy::{decide, FetchMode, ReadStrategy};
use crate::store::{EntryStore, StoreStats, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Result of [`SyncClient::read`].
#[derive(Debug)]
pub struct Read<V> {
    /// What the store held when the read was served.
    pub snapshot: CacheEntry<V>,

    /// Fetch started or joined by this read, if any.
    pub fetch: Option<FetchHandle<V>>,

    /// `Silent` when a value was served, `Blocking` when the caller has
    /// nothing to show until `fetch` settles.
    pub mode: FetchMode,
}

impl<V> Read<V> {
    pub fn value(&self) -> Option<&V> {
        self.snapshot.value.as_ref()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch.is_some()
    }
}

/// Stale-while-revalidate client for one value type.
///
/// # Example
///
/// ```
/// use swr_kit::{CacheKey, Error, ResourceConfig, SyncClient};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> swr_kit::Result<()> {
/// let client: SyncClient<u32> = SyncClient::new();
/// client.register(
///     "controls",
///     ResourceConfig::new(|_key: CacheKey| async move { Ok::<_, Error>(50u32) })
///         .with_stale_after(Duration::from_secs(180)),
/// );
///
/// let key = CacheKey::resource("controls")?;
/// assert_eq!(client.fetch(&key).await?, 50);
///
/// // Served from cache from now on
/// assert_eq!(client.get_snapshot(&key).value, Some(50));
/// # Ok(())
/// # }
/// ```
pub struct SyncClient<V> {
    store: Arc<EntryStore<V>>,
    coordinator: FetchCoordinator<V>,
    config: Arc<SyncConfig>,
    metrics: Arc<dyn SyncMetrics>,
}

impl<V> SyncClient<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Client with default configuration, system clock and no-op metrics.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SyncClientBuilder<V> {
        SyncClientBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Underlying entry store.
    pub fn store(&self) -> &Arc<EntryStore<V>> {
        &self.store
    }

    /// Register (or replace) a resource class.
    pub fn register(&self, resource: &str, config: ResourceConfig<V>) {
        self.store.register(resource, config);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Subscribe to `key` and start a fetch if the entry needs one.
    ///
    /// The listener receives the current snapshot before this returns, then
    /// one snapshot per write. A `Failed` entry is refetched: a new
    /// subscription is one of the ways out of a failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the key's resource is not registered.
    pub fn subscribe<L>(&self, key: &CacheKey, listener: L) -> Result<Subscription<V>>
    where
        L: Fn(&CacheEntry<V>) + Send + Sync + 'static,
    {
        let resource = self.store.resource(key.resource_name())?;
        let subscription = self.store.subscribe(key, listener);

        let snapshot = self.store.get_snapshot(key);
        let strategy = if snapshot.status == EntryStatus::Failed {
            ReadStrategy::Force
        } else {
            ReadStrategy::Revalidate
        };
        let stale_after = self.store.stale_after(key.resource_name());
        let decision = decide(&snapshot, stale_after, self.store.now(), strategy);
        if decision.should_fetch {
            self.spawn_background(key, &resource);
        }

        Ok(subscription)
    }

    /// Read `key` under `strategy`.
    ///
    /// Never blocks: a cached value is returned at once, however old, and any
    /// fetch the read needs is already running when this returns. Await
    /// `Read::fetch` to wait for it. Outside a tokio runtime the fetch only
    /// runs when awaited (see [`FetchCoordinator::ensure_fetch`]).
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the key's resource is not registered.
    pub fn read(&self, key: &CacheKey, strategy: ReadStrategy) -> Result<Read<V>> {
        let resource = self.store.resource(key.resource_name())?;
        let snapshot = self.store.get_snapshot(key);
        let stale_after = resource
            .stale_after
            .unwrap_or(self.config.default_stale_after);
        let decision = decide(&snapshot, stale_after, self.store.now(), strategy);

        match (decision.serve.is_some(), decision.should_fetch) {
            (true, false) => self.metrics.record_hit(key),
            (true, true) => self.metrics.record_stale(key),
            (false, _) => self.metrics.record_miss(key),
        }

        let fetch = if decision.should_fetch {
            Some(self.coordinator.ensure_fetch(key, resource.fetcher))
        } else {
            None
        };

        Ok(Read {
            snapshot,
            fetch,
            mode: decision.fetch_mode,
        })
    }

    /// Value of `key`, fetching only when there is nothing cached.
    ///
    /// A stale value is returned immediately and refreshed in the
    /// background. A `Failed` entry without a value returns its stored error
    /// without refetching; use [`refresh`](Self::refresh) for that.
    ///
    /// # Errors
    ///
    /// - `Error::ConfigError`: resource not registered
    /// - the fetch error, once retries are exhausted
    pub async fn fetch(&self, key: &CacheKey) -> Result<V> {
        let read = self.read(key, ReadStrategy::Revalidate)?;
        if let Some(value) = read.snapshot.value {
            return Ok(value);
        }
        match read.fetch {
            Some(handle) => handle.await,
            None => Err(read.snapshot.error.unwrap_or_else(|| {
                Error::Other(format!("no value cached for {}", key))
            })),
        }
    }

    /// Fetch `key` regardless of freshness, serving the cached value meanwhile.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the key's resource is not registered.
    pub fn refresh(&self, key: &CacheKey) -> Result<Read<V>> {
        self.read(key, ReadStrategy::Force)
    }

    /// Start (or join) the fetch of `key` with its registered fetcher.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the key's resource is not registered.
    pub fn ensure_fetch(&self, key: &CacheKey) -> Result<FetchHandle<V>> {
        let resource = self.store.resource(key.resource_name())?;
        Ok(self.coordinator.ensure_fetch(key, resource.fetcher))
    }

    /// Handle on the fetch currently running for `key`, if any.
    pub fn in_flight(&self, key: &CacheKey) -> Option<FetchHandle<V>> {
        self.coordinator.in_flight(key)
    }

    pub fn get_snapshot(&self, key: &CacheKey) -> CacheEntry<V> {
        self.store.get_snapshot(key)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a value known locally, e.g. returned by a mutation, as fresh.
    pub fn set_value(&self, key: &CacheKey, value: V) {
        self.store.set_value(key, value);
    }

    /// Mark every entry under `prefix` stale and refetch the watched ones.
    ///
    /// Staleness is recorded before this returns; the refetches run in the
    /// background.
    pub fn invalidate(&self, prefix: &KeyPrefix) -> Invalidation {
        self.invalidate_with(prefix, InvalidationMode::MarkStale)
    }

    pub fn invalidate_with(&self, prefix: &KeyPrefix, mode: InvalidationMode) -> Invalidation {
        let report = self.store.invalidate_with(prefix, mode);
        self.metrics.record_invalidate(prefix, report.matched.len());

        for key in &report.active {
            match self.store.resource(key.resource_name()) {
                Ok(resource) => self.spawn_background(key, &resource),
                Err(e) => warn!("Cannot refetch {} after invalidation: {}", key, e),
            }
        }
        report
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Evict entries idle for longer than `idle_retention`. Returns how many.
    pub fn sweep(&self) -> usize {
        let evicted = self.store.sweep(self.config.idle_retention);
        for key in &evicted {
            self.metrics.record_evict(key);
        }
        evicted.len()
    }

    /// Sweep every `interval` in the background until every clone of this
    /// client is dropped. Intervals below
    /// [`gc::MIN_COLLECT_INTERVAL`] are raised to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_collector(&self, interval: Duration) -> JoinHandle<()> {
        info!(
            "✓ Collector started (every {:?}, retention {:?})",
            interval, self.config.idle_retention
        );
        gc::spawn_collector(
            Arc::downgrade(&self.store),
            self.config.idle_retention,
            interval,
            Arc::clone(&self.metrics),
        )
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.store.keys()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn spawn_background(&self, key: &CacheKey, resource: &ResourceConfig<V>) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime: background fetch for {} skipped", key);
            return;
        }
        drop(
            self.coordinator
                .ensure_fetch(key, Arc::clone(&resource.fetcher)),
        );
    }
}

impl<V> Clone for SyncClient<V> {
    fn clone(&self) -> Self {
        SyncClient {
            store: Arc::clone(&self.store),
            coordinator: self.coordinator.clone(),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<V> Default for SyncClient<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder<V> {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn SyncMetrics>,
    resources: Vec<(String, ResourceConfig<V>)>,
}

impl<V> SyncClientBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        SyncClientBuilder {
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoOpMetrics),
            resources: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn SyncMetrics>) -> Self {
        self.metrics = Arc::from(metrics);
        self
    }

    pub fn with_resource(mut self, resource: &str, config: ResourceConfig<V>) -> Self {
        self.resources.push((resource.to_string(), config));
        self
    }

    pub fn build(self) -> SyncClient<V> {
        let store = Arc::new(EntryStore::new(
            self.clock,
            self.config.default_stale_after,
        ));
        for (resource, config) in self.resources {
            store.register(&resource, config);
        }
        let coordinator = FetchCoordinator::new(
            Arc::clone(&store),
            &self.config,
            Arc::clone(&self.metrics),
        );

        SyncClient {
            store,
            coordinator,
            config: Arc::new(self.config),
            metrics: self.metrics,
        }
    }
}

impl<V> Default for SyncClientBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
