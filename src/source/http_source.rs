use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::traits::FetchSource;

/// reqwest-backed transport. Per-attempt timeouts are enforced by the caller.
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("url-multiplexer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let resp = self.client.get(url).send().await?;

        let status = resp.status();
        debug!(url, status = status.as_u16(), "http fetch response");
        if status != StatusCode::OK {
            warn!(url, status = status.as_u16(), "http fetch failed");
            return Err(anyhow!("got {} status code for {}", status.as_u16(), url));
        }

        let bytes = resp.bytes().await?;
        Ok(bytes)
    }
}
