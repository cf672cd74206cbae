//! Observability hooks for the synchronization layer.
//!
//! Implement [`SyncMetrics`] to feed cache behavior into your monitoring
//! system:
//!
//! ```ignore
//! use swr_kit::observability::SyncMetrics;
//! use swr_kit::CacheKey;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl SyncMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, key: &CacheKey, duration: Duration) {
//!         // histogram!("fetch_latency", "resource" => key.resource_name()).record(duration);
//!     }
//!     // ... other hooks keep their logging defaults
//! }
//!
//! // let client = SyncClient::builder().with_metrics(Box::new(PrometheusMetrics)).build();
//! ```
//!
//! The default methods log through the `log` crate. [`NoOpMetrics`] (the
//! client default) drops everything.
//!
//! # Hooks
//!
//! - `record_hit()` - read served a fresh value
//! - `record_miss()` - read found no value and has to block on a fetch
//! - `record_stale()` - read served a stale value and started a refresh
//! - `record_fetch()` - fetch completed successfully
//! - `record_error()` - fetch settled into `Failed`
//! - `record_invalidate()` - prefix invalidation and the number of entries it touched
//! - `record_evict()` - entry removed by the collector

use crate::key::{CacheKey, KeyPrefix};
use std::time::Duration;

/// Trait for cache metrics collection.
pub trait SyncMetrics: Send + Sync {
    fn record_hit(&self, key: &CacheKey) {
        debug!("Cache HIT: {}", key);
    }

    fn record_miss(&self, key: &CacheKey) {
        debug!("Cache MISS: {}", key);
    }

    fn record_stale(&self, key: &CacheKey) {
        debug!("Cache STALE: {} (revalidating)", key);
    }

    fn record_fetch(&self, key: &CacheKey, duration: Duration) {
        debug!("Cache FETCH: {} took {:?}", key, duration);
    }

    fn record_error(&self, key: &CacheKey, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }

    fn record_invalidate(&self, prefix: &KeyPrefix, affected: usize) {
        debug!("Cache INVALIDATE: {} ({} entries)", prefix, affected);
    }

    fn record_evict(&self, key: &CacheKey) {
        debug!("Cache EVICT: {}", key);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl SyncMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &CacheKey) {}
    fn record_miss(&self, _key: &CacheKey) {}
    fn record_stale(&self, _key: &CacheKey) {}
    fn record_fetch(&self, _key: &CacheKey, _duration: Duration) {}
    fn record_error(&self, _key: &CacheKey, _error: &str) {}
    fn record_invalidate(&self, _prefix: &KeyPrefix, _affected: usize) {}
    fn record_evict(&self, _key: &CacheKey) {}
}

/// Metrics that only log, using the trait's default methods.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl SyncMetrics for LogMetrics {}
