//! Freshness policy: what a read serves and whether it fetches.
//!
//! # The Three Read Strategies
//!
//! ```
//! use swr_kit::policy::ReadStrategy;
//!
//! // 1. Revalidate - serve cached, refresh in the background when stale (default)
//! let _s = ReadStrategy::Revalidate;
//!
//! // 2. Force - always fetch, still serving whatever is cached meanwhile
//! let _s = ReadStrategy::Force;
//!
//! // 3. CacheOnly - serve cached, never fetch
//! let _s = ReadStrategy::CacheOnly;
//! ```
//!
//! # Decision Table
//!
//! | Entry | Revalidate | Force | CacheOnly |
//! |-------|------------|-------|-----------|
//! | no value | fetch, blocking | fetch, blocking | serve nothing |
//! | fresh value | serve | serve + silent fetch | serve |
//! | stale value | serve + silent fetch | serve + silent fetch | serve |
//! | failed | serve, no fetch | serve + fetch | serve |
//!
//! A cached value is always served immediately, however old it is. Only a
//! read with nothing to show blocks. A failed entry is not retried by plain
//! reads: recovery takes a new subscription, a forced refresh or an
//! invalidation.

use crate::entry::{CacheEntry, EntryStatus};
use std::time::{Duration, Instant};

/// How a read treats the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    /// **Revalidate**: stale-while-revalidate.
    ///
    /// Flow:
    /// 1. No value: fetch and let the caller wait for it
    /// 2. Fresh value: serve it
    /// 3. Stale value: serve it and refresh in the background
    #[default]
    Revalidate,

    /// **Force**: fetch regardless of freshness.
    ///
    /// Use when: the user asked for a refresh, or after a failure.
    Force,

    /// **CacheOnly**: serve whatever is cached, never fetch.
    CacheOnly,
}

impl std::fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadStrategy::Revalidate => write!(f, "Revalidate"),
            ReadStrategy::Force => write!(f, "Force"),
            ReadStrategy::CacheOnly => write!(f, "CacheOnly"),
        }
    }
}

/// How the caller experiences a fetch started by a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    /// A value is being served; the fetch refreshes it in the background.
    Silent,
    /// Nothing to serve; the caller has to wait for the fetch.
    Blocking,
}

/// Outcome of [`decide`].
#[derive(Clone, Debug, PartialEq)]
pub struct Decision<V> {
    /// Value to serve right now.
    pub serve: Option<V>,
    pub should_fetch: bool,
    pub fetch_mode: FetchMode,
}

/// Decide what a read of `entry` serves and whether it fetches.
///
/// Pure: depends only on its arguments, so tests drive it with any `now`.
///
/// # Example
///
/// ```
/// use swr_kit::policy::{decide, FetchMode, ReadStrategy};
/// use swr_kit::{CacheEntry, EntryStatus};
/// use std::time::{Duration, Instant};
///
/// let t0 = Instant::now();
/// let mut entry = CacheEntry::idle();
/// entry.value = Some(50);
/// entry.status = EntryStatus::Fresh;
/// entry.fetched_at = Some(t0);
///
/// let stale_after = Duration::from_secs(180);
/// let later = t0 + stale_after + Duration::from_millis(1);
/// let decision = decide(&entry, stale_after, later, ReadStrategy::Revalidate);
///
/// assert_eq!(decision.serve, Some(50));
/// assert!(decision.should_fetch);
/// assert_eq!(decision.fetch_mode, FetchMode::Silent);
/// ```
pub fn decide<V: Clone>(
    entry: &CacheEntry<V>,
    stale_after: Duration,
    now: Instant,
    strategy: ReadStrategy,
) -> Decision<V> {
    let serve = entry.value.clone();
    let fetch_mode = if serve.is_some() {
        FetchMode::Silent
    } else {
        FetchMode::Blocking
    };

    let should_fetch = match strategy {
        ReadStrategy::CacheOnly => false,
        ReadStrategy::Force => true,
        ReadStrategy::Revalidate => match entry.status {
            EntryStatus::Failed => false,
            EntryStatus::Stale => true,
            _ if serve.is_none() => true,
            _ => is_expired(entry, stale_after, now),
        },
    };

    Decision {
        serve,
        should_fetch,
        fetch_mode,
    }
}

/// Whether the value of `entry` is past its freshness window at `now`.
pub fn is_expired<V>(entry: &CacheEntry<V>, stale_after: Duration, now: Instant) -> bool {
    entry
        .age(now)
        .map_or(true, |age| age >= stale_after)
}
