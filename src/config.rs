//! Client and per-resource configuration.
//!
//! # Setup-Time vs Per-Resource Configuration
//!
//! - **Client-wide** (`SyncConfig`): idle retention, retry policy, optional
//!   fetch timeout and the stale-after fallback for resources that do not
//!   set their own.
//! - **Per resource** (`ResourceConfig`): the fetcher and the stale-after
//!   window of that resource class.
//!
//! ```
//! use swr_kit::config::{RetryPolicy, SyncConfig};
//! use std::time::Duration;
//!
//! let config = SyncConfig::default()
//!     .with_idle_retention(Duration::from_secs(60))
//!     .with_retry(RetryPolicy::default().with_max_retries(2));
//! assert_eq!(config.retry.max_retries, 2);
//! ```
//!
//! The retry count and the idle window are product tuning, not correctness
//! requirements; both are plain fields.

use crate::fetcher::Fetcher;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default time an unsubscribed entry is kept before the collector may evict it.
pub const DEFAULT_IDLE_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Default first retry delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded retry applied by the fetch coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retry).
    pub max_retries: u32,

    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn with_max_retries(mut self, count: u32) -> Self {
        self.max_retries = count;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    /// Exactly one retry after a short pause.
    fn default() -> Self {
        RetryPolicy {
            max_retries: 1,
            base_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Client-wide settings.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    /// Stale-after used by resources that do not set their own.
    ///
    /// Zero means "stale as soon as fetched": every read revalidates.
    pub default_stale_after: Duration,

    /// How long an entry without subscribers survives before eviction.
    pub idle_retention: Duration,

    pub retry: RetryPolicy,

    /// Per-attempt deadline. `None` leaves timeouts to the fetcher.
    pub fetch_timeout: Option<Duration>,
}

impl SyncConfig {
    pub fn with_default_stale_after(mut self, stale_after: Duration) -> Self {
        self.default_stale_after = stale_after;
        self
    }

    pub fn with_idle_retention(mut self, retention: Duration) -> Self {
        self.idle_retention = retention;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            default_stale_after: Duration::ZERO,
            idle_retention: DEFAULT_IDLE_RETENTION,
            retry: RetryPolicy::default(),
            fetch_timeout: None,
        }
    }
}

/// Registration of one resource class.
///
/// ```
/// use swr_kit::{CacheKey, Error, ResourceConfig};
/// use std::time::Duration;
///
/// let controls = ResourceConfig::<u32>::new(|_key: CacheKey| async move { Ok::<_, Error>(50u32) })
///     .with_stale_after(Duration::from_secs(180));
/// assert_eq!(controls.stale_after, Some(Duration::from_secs(180)));
/// ```
pub struct ResourceConfig<V> {
    pub fetcher: Arc<dyn Fetcher<V>>,

    /// Freshness window; `None` falls back to `SyncConfig::default_stale_after`.
    pub stale_after: Option<Duration>,
}

impl<V> ResourceConfig<V> {
    pub fn new<F>(fetcher: F) -> Self
    where
        F: Fetcher<V> + 'static,
    {
        ResourceConfig {
            fetcher: Arc::new(fetcher),
            stale_after: None,
        }
    }

    /// Register an already shared fetcher.
    pub fn from_arc(fetcher: Arc<dyn Fetcher<V>>) -> Self {
        ResourceConfig {
            fetcher,
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }
}

impl<V> Clone for ResourceConfig<V> {
    fn clone(&self) -> Self {
        ResourceConfig {
            fetcher: Arc::clone(&self.fetcher),
            stale_after: self.stale_after,
        }
    }
}

impl<V> fmt::Debug for ResourceConfig<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}
