//! Entry store: per-key values, fetch state and subscribers.
//!
//! Uses DashMap for concurrent access with per-key sharding. Every mutation
//! of a key happens under that key's shard lock, so readers only ever observe
//! complete entries. Listeners are always invoked after the lock is released,
//! which lets a listener read the store (or drop its own subscription) from
//! inside the callback.

use crate::clock::Clock;
use crate::config::ResourceConfig;
use crate::entry::{CacheEntry, EntryStatus};
use crate::error::{Error, Result};
use crate::key::CacheKey;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Callback receiving a fresh snapshot after every write to its key.
pub type Listener<V> = Arc<dyn Fn(&CacheEntry<V>) + Send + Sync>;

/// The shared, spawned fetch of one key.
pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Running fetch registered on a slot.
pub(crate) struct InFlight<V> {
    pub(crate) id: u64,
    pub(crate) fetch: SharedFetch<V>,
}

/// Mutable per-key state. Never handed out; readers get a [`CacheEntry`].
pub(crate) struct Slot<V> {
    pub(crate) value: Option<V>,
    /// Stored status. `Fresh` decays to `Stale` at snapshot time.
    pub(crate) status: EntryStatus,
    pub(crate) error: Option<Error>,
    pub(crate) fetched_at: Option<Instant>,
    /// In subscription order.
    pub(crate) listeners: Vec<(u64, Listener<V>)>,
    pub(crate) in_flight: Option<InFlight<V>>,
    /// Set while nobody is subscribed; drives the collector.
    pub(crate) idle_since: Option<Instant>,
    /// Bumped by every invalidation.
    pub(crate) generation: u64,
}

impl<V> Slot<V> {
    fn new(now: Instant) -> Self {
        Slot {
            value: None,
            status: EntryStatus::Idle,
            error: None,
            fetched_at: None,
            listeners: Vec::new(),
            in_flight: None,
            idle_since: Some(now),
            generation: 0,
        }
    }

    fn listeners(&self) -> Vec<Listener<V>> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Thread-safe store of cache entries and resource registrations.
///
/// Created by [`SyncClient`](crate::SyncClient); usable on its own when the
/// caller drives fetches itself.
///
/// # Example
///
/// ```
/// use swr_kit::store::EntryStore;
/// use swr_kit::clock::SystemClock;
/// use swr_kit::{CacheKey, EntryStatus};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn main() -> swr_kit::Result<()> {
/// let store: Arc<EntryStore<u32>> = Arc::new(EntryStore::new(Arc::new(SystemClock), Duration::from_secs(60)));
/// let key = CacheKey::resource("controls")?;
///
/// let _sub = store.subscribe(&key, |entry| println!("controls -> {:?}", entry.value));
/// store.write(&key, Ok(50));
///
/// assert_eq!(store.get_snapshot(&key).status, EntryStatus::Fresh);
/// # Ok(())
/// # }
/// ```
pub struct EntryStore<V> {
    pub(crate) entries: DashMap<CacheKey, Slot<V>>,
    resources: DashMap<String, ResourceConfig<V>>,
    default_stale_after: Duration,
    clock: Arc<dyn Clock>,
    next_listener: AtomicU64,
    next_fetch: AtomicU64,
}

impl<V> EntryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, default_stale_after: Duration) -> Self {
        EntryStore {
            entries: DashMap::new(),
            resources: DashMap::new(),
            default_stale_after,
            clock,
            next_listener: AtomicU64::new(1),
            next_fetch: AtomicU64::new(1),
        }
    }

    /// Current instant according to the injected clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Resource registry
    // ------------------------------------------------------------------

    /// Register (or replace) the fetcher and freshness window of a resource.
    pub fn register(&self, resource: &str, config: ResourceConfig<V>) {
        debug!(
            "Registered resource {} (stale after {:?})",
            resource,
            config.stale_after.unwrap_or(self.default_stale_after)
        );
        self.resources.insert(resource.to_string(), config);
    }

    /// Registration of `resource`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the resource was never registered.
    pub fn resource(&self, resource: &str) -> Result<ResourceConfig<V>> {
        self.resources
            .get(resource)
            .map(|config| config.clone())
            .ok_or_else(|| {
                Error::ConfigError(format!("resource '{}' is not registered", resource))
            })
    }

    /// Freshness window of a resource class.
    pub fn stale_after(&self, resource: &str) -> Duration {
        self.resources
            .get(resource)
            .and_then(|config| config.stale_after)
            .unwrap_or(self.default_stale_after)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Complete snapshot of `key`. Unknown keys yield an `Idle` snapshot.
    pub fn get_snapshot(&self, key: &CacheKey) -> CacheEntry<V> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(slot) => self.snapshot(key, &slot, now),
            None => CacheEntry::idle(),
        }
    }

    /// Whether the store holds an entry for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// All keys currently held, in canonical order.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry counts by effective status.
    pub fn stats(&self) -> StoreStats {
        let now = self.clock.now();
        let mut stats = StoreStats::default();
        for item in self.entries.iter() {
            let snapshot = self.snapshot(item.key(), item.value(), now);
            stats.total_entries += 1;
            stats.subscribers += snapshot.subscriber_count;
            if snapshot.in_flight {
                stats.in_flight += 1;
            }
            match snapshot.status {
                EntryStatus::Idle => stats.idle += 1,
                EntryStatus::Loading | EntryStatus::Refreshing => stats.fetching += 1,
                EntryStatus::Fresh => stats.fresh += 1,
                EntryStatus::Stale => stats.stale += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Print store statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Store Stats: {} entries ({} fresh, {} stale, {} failed, {} fetching), {} subscribers",
            stats.total_entries,
            stats.fresh,
            stats.stale,
            stats.failed,
            stats.fetching,
            stats.subscribers
        );
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to `key`, creating its entry if needed.
    ///
    /// The listener immediately receives the current snapshot (which may be
    /// `Idle` or stale) and then one snapshot per write. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe<L>(self: &Arc<Self>, key: &CacheKey, listener: L) -> Subscription<V>
    where
        L: Fn(&CacheEntry<V>) + Send + Sync + 'static,
    {
        let now = self.clock.now();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: Listener<V> = Arc::new(listener);

        let snapshot = {
            let mut slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Slot::new(now));
            slot.listeners.push((id, Arc::clone(&listener)));
            slot.idle_since = None;
            self.snapshot(key, &slot, now)
        };

        debug!(
            "» Subscribed #{} to {} ({} subscribers)",
            id, key, snapshot.subscriber_count
        );
        listener(&snapshot);

        Subscription {
            store: Arc::downgrade(self),
            key: key.clone(),
            id,
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Record a fetch outcome for `key` and notify every subscriber.
    ///
    /// - `Ok(value)`: stores the value, marks the entry `Fresh`, clears any error.
    /// - `Err(error)`: keeps the previous value, marks the entry `Failed`.
    ///
    /// Either way the in-flight marker is cleared. All listeners have been
    /// called, in subscription order, when this returns.
    pub fn write(&self, key: &CacheKey, outcome: Result<V>) {
        let now = self.clock.now();
        let (snapshot, listeners) = {
            let mut slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Slot::new(now));
            apply_outcome(&mut slot, outcome, now, false);
            slot.in_flight = None;
            (self.snapshot(key, &slot, now), slot.listeners())
        };
        notify(&listeners, &snapshot);
    }

    /// Store a locally known value (e.g. returned by a mutation) as fresh.
    pub fn set_value(&self, key: &CacheKey, value: V) {
        self.write(key, Ok(value));
    }

    /// Settle a coordinator fetch.
    ///
    /// Only clears the in-flight marker if it still belongs to `fetch_id`;
    /// while another fetch owns it the entry stays `Loading`/`Refreshing`.
    /// A fetch that started before an invalidation lands `Stale`, unless the
    /// entry is watched: then the value is stored, the marker is kept and
    /// [`Settled::Refetch`] tells the caller to fetch again.
    pub(crate) fn complete_fetch(
        &self,
        key: &CacheKey,
        fetch_id: u64,
        generation: u64,
        outcome: Result<V>,
    ) -> Settled {
        let now = self.clock.now();
        let (snapshot, listeners, settled) = {
            let mut slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Slot::new(now));
            let invalidated = slot.generation != generation;
            let owns_marker = slot.in_flight.as_ref().is_some_and(|f| f.id == fetch_id);

            if invalidated && owns_marker && !slot.listeners.is_empty() {
                let settled = Settled::Refetch(slot.generation);
                let Ok(value) = outcome else {
                    // Nothing new to show, the next round decides
                    return settled;
                };
                slot.value = Some(value);
                slot.fetched_at = Some(now);
                slot.error = None;
                slot.status = EntryStatus::Refreshing;
                (self.snapshot(key, &slot, now), slot.listeners(), settled)
            } else {
                apply_outcome(&mut slot, outcome, now, invalidated);
                if owns_marker {
                    slot.in_flight = None;
                } else if slot.in_flight.is_some() {
                    mark_fetching(&mut slot);
                }
                (self.snapshot(key, &slot, now), slot.listeners(), Settled::Done)
            }
        };
        notify(&listeners, &snapshot);
        settled
    }

    /// Generation of `key`; 0 for unknown keys.
    pub(crate) fn generation(&self, key: &CacheKey) -> u64 {
        self.entries.get(key).map_or(0, |slot| slot.generation)
    }

    /// Register a fetch for `key` unless one is already running.
    ///
    /// `start` receives the new fetch id and the entry generation and must
    /// return the (not yet polled) shared future. Returns the in-flight fetch
    /// and whether it was started by this call.
    pub(crate) fn begin_fetch<F>(&self, key: &CacheKey, start: F) -> (SharedFetch<V>, bool)
    where
        F: FnOnce(u64, u64) -> SharedFetch<V>,
    {
        let now = self.clock.now();
        let mut slot = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Slot::new(now));

        if let Some(running) = &slot.in_flight {
            return (running.fetch.clone(), false);
        }

        let id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
        let fetch = start(id, slot.generation);
        slot.in_flight = Some(InFlight {
            id,
            fetch: fetch.clone(),
        });
        mark_fetching(&mut slot);
        (fetch, true)
    }

    /// Fetch currently running for `key`, if any.
    pub(crate) fn in_flight(&self, key: &CacheKey) -> Option<SharedFetch<V>> {
        self.entries
            .get(key)
            .and_then(|slot| slot.in_flight.as_ref().map(|f| f.fetch.clone()))
    }

    pub(crate) fn snapshot(&self, key: &CacheKey, slot: &Slot<V>, now: Instant) -> CacheEntry<V> {
        let mut status = slot.status;
        if status == EntryStatus::Fresh {
            let stale_after = self.stale_after(key.resource_name());
            let expired = slot
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) >= stale_after);
            if expired {
                status = EntryStatus::Stale;
            }
        }

        CacheEntry {
            value: slot.value.clone(),
            status,
            error: slot.error.clone(),
            fetched_at: slot.fetched_at,
            subscriber_count: slot.listeners.len(),
            in_flight: slot.in_flight.is_some(),
        }
    }
}

fn apply_outcome<V>(slot: &mut Slot<V>, outcome: Result<V>, now: Instant, invalidated: bool) {
    match outcome {
        Ok(value) => {
            slot.value = Some(value);
            slot.fetched_at = Some(now);
            slot.error = None;
            slot.status = if invalidated {
                EntryStatus::Stale
            } else {
                EntryStatus::Fresh
            };
        }
        Err(error) => {
            slot.status = EntryStatus::Failed;
            slot.error = Some(error);
        }
    }
}

fn mark_fetching<V>(slot: &mut Slot<V>) {
    slot.status = if slot.value.is_some() {
        EntryStatus::Refreshing
    } else {
        EntryStatus::Loading
    };
    slot.error = None;
}

fn notify<V>(listeners: &[Listener<V>], snapshot: &CacheEntry<V>) {
    for listener in listeners {
        listener(snapshot);
    }
}

/// How a coordinator fetch settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub(crate) enum Settled {
    /// Outcome recorded.
    Done,
    /// Invalidated mid-flight while watched: fetch again under the new
    /// generation, keeping the in-flight marker.
    Refetch(u64),
}

/// Active subscription to one key. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription<V> {
    store: Weak<EntryStore<V>>,
    key: CacheKey,
    id: u64,
}

impl<V> Subscription<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Unsubscribe now. Never cancels a fetch shared with other subscribers.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.key, self.id);
        }
    }
}

impl<V> EntryStore<V> {
    // Kept free of the `V` bounds so `Subscription::drop` can call it.
    fn unsubscribe(&self, key: &CacheKey, id: u64) {
        let now = self.clock.now();
        if let Some(mut slot) = self.entries.get_mut(key) {
            slot.listeners.retain(|(listener_id, _)| *listener_id != id);
            if slot.listeners.is_empty() && slot.idle_since.is_none() {
                slot.idle_since = Some(now);
            }
            debug!(
                "« Unsubscribed #{} from {} ({} subscribers)",
                id,
                key,
                slot.listeners.len()
            );
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_entries: usize,
    pub idle: usize,
    pub fresh: usize,
    pub stale: usize,
    pub failed: usize,
    pub fetching: usize,
    pub in_flight: usize,
    pub subscribers: usize,
}
