//! # swr-kit
//!
//! A keyed, in-process stale-while-revalidate cache for client-side data
//! synchronization.
//!
//! ## Features
//!
//! - **Stale-While-Revalidate:** Cached values are served instantly, however old, and refreshed in the background
//! - **Single-Flight:** Concurrent requests for the same key share one fetch
//! - **Structured Keys:** Keys are (resource, filter) pairs, normalized so field order never matters
//! - **Prefix Invalidation:** Mark a whole resource (or a filtered subset) stale after a mutation
//! - **No Regression on Failure:** A failed refresh keeps the last good value
//! - **Idle Collection:** Entries nobody watches are evicted after a retention window
//!
//! ## Quick Start
//!
//! ```ignore
//! use swr_kit::{CacheKey, KeyPrefix, ResourceConfig, SyncClient, Error};
//! use std::time::Duration;
//!
//! // 1. Create the client (cheap to clone, share it everywhere)
//! let client: SyncClient<Controls> = SyncClient::new();
//!
//! // 2. Register each resource with its fetcher and freshness window
//! client.register(
//!     "controls",
//!     ResourceConfig::new(|key: CacheKey| async move {
//!         api.controls(key.filter()).await.map_err(|e| Error::FetchError(e.to_string()))
//!     })
//!     .with_stale_after(Duration::from_secs(180)),
//! );
//!
//! // 3. Subscribe from a view: the listener gets the current snapshot now,
//! //    then one snapshot per write
//! let key = CacheKey::build("controls", &json!({ "framework": "soc2" }))?;
//! let _sub = client.subscribe(&key, |entry| render(entry.value.as_ref(), entry.status))?;
//!
//! // 4. After a mutation, invalidate everything under the resource
//! client.invalidate(&KeyPrefix::resource("controls"));
//!
//! // 5. Evict idle entries every minute
//! client.spawn_collector(Duration::from_secs(60));
//! ```
//!
//! ## Lower-Level Pieces
//!
//! [`EntryStore`](store::EntryStore), [`FetchCoordinator`](coordinator::FetchCoordinator)
//! and [`policy::decide`] can be used on their own when the caller wants to
//! drive fetches itself.

#[macro_use]
extern crate log;

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod fetcher;
pub mod gc;
pub mod invalidation;
pub mod key;
pub mod observability;
pub mod policy;
pub mod service;
pub mod store;

// Re-exports for convenience
pub use config::{ResourceConfig, RetryPolicy, SyncConfig};
pub use coordinator::FetchHandle;
pub use entry::{CacheEntry, EntryStatus};
pub use error::{Error, Result};
pub use fetcher::Fetcher;
pub use invalidation::{Invalidation, InvalidationMode};
pub use key::{CacheKey, KeyPrefix};
pub use policy::{FetchMode, ReadStrategy};
pub use service::{Read, SyncClient, SyncClientBuilder};
pub use store::Subscription;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
