//! Invalidation bus: prefix-based staleness after mutations.
//!
//! Invalidation is synchronous: when [`EntryStore::invalidate`] returns, every
//! matching entry is already marked. Cached values are kept, so the next read
//! is a silent background refresh rather than a flash to empty. Refetching the
//! entries somebody is watching is left to the caller (see
//! [`SyncClient::invalidate`](crate::SyncClient::invalidate)), and those
//! refetches run asynchronously with no ordering across keys.
//!
//! | Entry before | After `MarkStale` |
//! |--------------|-------------------|
//! | `Fresh` / `Stale` | `Stale` |
//! | `Failed` with value | `Stale` |
//! | `Failed` without value | `Idle` |
//! | `Loading` / `Refreshing` | unchanged; the result lands `Stale`, or is fetched again if watched |
//! | `Idle` | unchanged |

use crate::entry::EntryStatus;
use crate::key::{CacheKey, KeyPrefix};
use crate::store::EntryStore;

/// What an invalidation does to matching entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InvalidationMode {
    /// Keep values, mark entries stale.
    #[default]
    MarkStale,

    /// Remove entries nobody is watching and nothing is fetching; mark the
    /// rest stale.
    Evict,
}

/// Summary of one invalidation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Invalidation {
    /// Entries matched by the prefix, in canonical key order.
    pub matched: Vec<CacheKey>,
    /// Matching entries that were removed (`InvalidationMode::Evict` only).
    pub evicted: Vec<CacheKey>,
    /// Matching entries with subscribers and no fetch running. These are
    /// the ones a client refetches in the background. A watched entry with
    /// a fetch running is left out: that fetch goes again on its own.
    pub active: Vec<CacheKey>,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }
}

impl<V> EntryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Mark every entry under `prefix` stale, keeping cached values.
    pub fn invalidate(&self, prefix: &KeyPrefix) -> Invalidation {
        self.invalidate_with(prefix, InvalidationMode::MarkStale)
    }

    /// Invalidate every entry under `prefix` using `mode`.
    pub fn invalidate_with(&self, prefix: &KeyPrefix, mode: InvalidationMode) -> Invalidation {
        let mut report = Invalidation::default();

        if mode == InvalidationMode::Evict {
            self.entries.retain(|key, slot| {
                let removable = prefix.matches(key)
                    && slot.listeners.is_empty()
                    && slot.in_flight.is_none();
                if removable {
                    report.matched.push(key.clone());
                    report.evicted.push(key.clone());
                }
                !removable
            });
        }

        for mut item in self.entries.iter_mut() {
            let (key, slot) = item.pair_mut();
            if !prefix.matches(key) {
                continue;
            }

            slot.generation += 1;
            match slot.status {
                EntryStatus::Fresh | EntryStatus::Stale => slot.status = EntryStatus::Stale,
                EntryStatus::Failed if slot.value.is_some() => {
                    slot.status = EntryStatus::Stale;
                    slot.error = None;
                }
                EntryStatus::Failed => {
                    slot.status = EntryStatus::Idle;
                    slot.error = None;
                }
                EntryStatus::Idle | EntryStatus::Loading | EntryStatus::Refreshing => {}
            }

            report.matched.push(key.clone());
            if !slot.listeners.is_empty() && slot.in_flight.is_none() {
                report.active.push(key.clone());
            }
        }

        report.matched.sort();
        report.evicted.sort();
        report.active.sort();

        debug!(
            "✓ Invalidated {} ({} matched, {} evicted, {} active)",
            prefix,
            report.matched.len(),
            report.evicted.len(),
            report.active.len()
        );
        report
    }
}
