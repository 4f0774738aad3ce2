use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Network transport used by workers for a single fetch attempt.
#[async_trait]
pub trait FetchSource: Send + Sync {
    /// GET `url` and return the full body. Any non-200 status is an error.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}
