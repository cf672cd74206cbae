//! Cache entry snapshots handed to readers and subscribers.

use crate::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum EntryStatus {
    /// Never fetched, nothing in flight.
    #[default]
    Idle,
    /// First fetch in flight; no value to show yet.
    Loading,
    /// Value present and younger than the resource's stale-after window.
    Fresh,
    /// Value present but past its window, or explicitly invalidated.
    Stale,
    /// Value present and a background refresh is in flight.
    Refreshing,
    /// Last fetch failed. Any previous value is kept.
    Failed,
}

impl EntryStatus {
    /// Whether a fetch is running for an entry in this state.
    pub fn is_fetching(self) -> bool {
        matches!(self, EntryStatus::Loading | EntryStatus::Refreshing)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Idle => write!(f, "Idle"),
            EntryStatus::Loading => write!(f, "Loading"),
            EntryStatus::Fresh => write!(f, "Fresh"),
            EntryStatus::Stale => write!(f, "Stale"),
            EntryStatus::Refreshing => write!(f, "Refreshing"),
            EntryStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Complete, immutable view of one cache entry at one instant.
///
/// Readers never see a half-updated entry: a snapshot is cut under the
/// store's per-key lock.
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    /// Last successfully fetched payload.
    pub value: Option<V>,
    pub status: EntryStatus,
    /// Last fetch failure; only set while `status` is `Failed`.
    pub error: Option<Error>,
    /// When the last successful fetch completed.
    pub fetched_at: Option<Instant>,
    pub subscriber_count: usize,
    /// A fetch for this key is currently running.
    pub in_flight: bool,
}

impl<V> CacheEntry<V> {
    /// Snapshot of a key the store has never seen.
    pub fn idle() -> Self {
        CacheEntry {
            value: None,
            status: EntryStatus::Idle,
            error: None,
            fetched_at: None,
            subscriber_count: 0,
            in_flight: false,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Age of the cached value at `now`.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.fetched_at.map(|at| now.saturating_duration_since(at))
    }

    /// Whether a consumer should show a blocking error (nothing to render).
    ///
    /// With a cached value the error is informational only.
    pub fn is_blocking_error(&self) -> bool {
        self.status == EntryStatus::Failed && self.value.is_none()
    }
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self::idle()
    }
}
