//! Error types for the synchronization layer.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the synchronization layer.
///
/// Errors are `Clone` because a single fetch outcome is shared by every caller
/// that joined the same in-flight request, and the last failure is kept on the
/// cache entry for late subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The fetcher failed (network error, HTTP error status, auth failure).
    ///
    /// Captured by the fetch coordinator, stored on the entry and surfaced as
    /// `EntryStatus::Failed`. Never thrown into a subscriber.
    ///
    /// **Recovery:** a new subscription, a forced refresh, or an invalidation.
    FetchError(String),

    /// A fetch attempt exceeded the configured `fetch_timeout`.
    ///
    /// Treated exactly like `FetchError`: it takes the bounded retry path and
    /// then settles the entry into `Failed`.
    Timeout(String),

    /// A filter could not be turned into a canonical cache key.
    ///
    /// Raised by the key builder when:
    /// - the filter does not serialize to a map
    /// - a filter field is a nested map or a nested array
    /// - a value's `Serialize` impl fails
    ///
    /// This is a caller defect. It is never retried.
    SerializationError(String),

    /// Invalid configuration.
    ///
    /// Common causes:
    /// - Reading a resource that was never registered
    /// - An empty resource name
    ConfigError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether the coordinator may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::FetchError(_) | Error::Timeout(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FetchError(msg) => write!(f, "Fetch error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
