// Error taxonomy shared by the engine and the HTTP layer.

use thiserror::Error;

/// Errors returned by the response cache. Never surfaced to batch callers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Missing key or expired entry.
    #[error("cache item not found")]
    NotFound,

    /// The cache lifecycle has ended; the store is gone for good.
    #[error("cache is unavailable")]
    Unavailable,
}

/// Errors returned by a batch fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Malformed request or URL count out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The admission gate is at capacity.
    #[error("too many requests, try again later")]
    AdmissionRejected,

    /// A URL could not be fetched and the retry policy gave up on it.
    #[error("fetch {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// The batch was cancelled by its caller or by shutdown.
    #[error("batch cancelled")]
    Cancelled,

    /// A worker died without reporting a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FetchError {
    pub fn upstream(url: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Upstream {
            url: url.into(),
            source,
        }
    }
}
