//! Fetcher trait: the inbound seam to the API layer.
//!
//! The synchronization layer never talks to the network itself. Each resource
//! is registered with a `Fetcher` supplied by the page/API layer, and the
//! fetch coordinator calls it whenever a key needs (re)loading.
//!
//! # Implementing Fetcher
//!
//! Any `Fn(CacheKey) -> impl Future<Output = Result<V>>` closure is a fetcher:
//!
//! ```ignore
//! use swr_kit::{CacheKey, Error, Fetcher};
//!
//! let fetch_controls = |key: CacheKey| async move {
//!     api.get("/controls", key.filter())
//!         .await
//!         .map_err(|e| Error::FetchError(e.to_string()))
//! };
//! ```
//!
//! Implement the trait on a struct when the fetcher carries state, such as an
//! HTTP client or a base URL.
//!
//! # Error Handling
//!
//! Return `Error::FetchError` for network failures, HTTP error statuses and
//! authorization failures. The coordinator retries those according to its
//! `RetryPolicy` and then records the error on the entry.

use crate::error::Result;
use crate::key::CacheKey;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

/// Loads the current value of a key from the source of truth.
///
/// Returned futures must be `'static` because the coordinator spawns them on
/// the runtime and shares the outcome between every caller of the same key.
pub trait Fetcher<V>: Send + Sync {
    /// Fetch the value addressed by `key`.
    ///
    /// # Errors
    /// Returns `Err` if the source is unavailable or rejects the request.
    fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<V>>;
}

impl<V, F, Fut> Fetcher<V> for F
where
    V: 'static,
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<V>> {
        (self)(key.clone()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;

    struct FixedFetcher {
        total: u32,
    }

    impl Fetcher<u32> for FixedFetcher {
        fn fetch(&self, _key: &CacheKey) -> BoxFuture<'static, Result<u32>> {
            let total = self.total;
            async move { Ok(total) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_closure_fetcher_receives_key() {
        let fetcher = |key: CacheKey| async move { Ok::<_, Error>(key.resource_name().len()) };
        let key = CacheKey::resource("controls").unwrap();

        let value = Fetcher::<usize>::fetch(&fetcher, &key).await.unwrap();
        assert_eq!(value, 8);
    }

    #[tokio::test]
    async fn test_struct_fetcher_as_trait_object() {
        let fetcher: Arc<dyn Fetcher<u32>> = Arc::new(FixedFetcher { total: 50 });
        let key = CacheKey::resource("controls").unwrap();
        assert_eq!(fetcher.fetch(&key).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_failing_fetcher() {
        let fetcher =
            |_key: CacheKey| async move { Err::<u32, _>(Error::FetchError("401".to_string())) };
        let key = CacheKey::resource("integrations").unwrap();
        let result = Fetcher::<u32>::fetch(&fetcher, &key).await;
        assert_eq!(result, Err(Error::FetchError("401".to_string())));
    }
}
