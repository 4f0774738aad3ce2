use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::engine::multiplexer::{MultiplexerOptions, RetryOptions};

/// Number of body bytes returned to callers for each fetched URL.
pub const PREVIEW_BYTES: usize = 20;

/// Default upper bound on URLs per batch.
pub const DEFAULT_MAX_URLS: usize = 20;

/// Default number of concurrently admitted batches when the engine is built
/// without a configured limit.
pub const DEFAULT_REQUESTS_LIMIT: usize = 100;

/// Default number of workers spawned per batch.
pub const DEFAULT_WORKER_LIMIT: usize = 4;

/// Default per-attempt network timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Default total attempts per URL, first attempt included.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default wait between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Load ratio at or above which retries are refused.
pub const DEFAULT_RETRY_FILL_RATIO: f64 = 0.8;

/// Floor substituted for a zero cache TTL.
pub const CACHE_TTL_FLOOR: Duration = Duration::from_secs(5);

/// Environment variable prefix, e.g. `MULTIPLEXER_MAX_URLS=10`.
pub const ENV_PREFIX: &str = "MULTIPLEXER";

/// Process configuration as read from a TOML file and the environment.
///
/// Durations are whole seconds. Zeros are replaced by engine defaults when
/// converted with [`MultiplexerConfig::options`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Listen address of the HTTP server.
    pub bind_addr: String,
    /// Maximum URLs accepted in one batch.
    pub max_urls: usize,
    /// Maximum concurrently processed batches.
    pub requests_limit: usize,
    /// Workers spawned per batch.
    pub worker_limit: usize,
    /// Per-attempt network timeout, seconds.
    pub fetch_timeout: u64,
    pub retry_enabled: bool,
    pub retry_max_attempts: u32,
    /// Seconds to wait before a retry.
    pub retry_delay: u64,
    /// Percentage of batch capacity above which retries are refused.
    pub retry_fill_ratio: i64,
    pub cache_enabled: bool,
    /// Cache entry lifetime, seconds.
    pub cache_ttl: u64,
    /// Default `tracing` filter, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_urls: DEFAULT_MAX_URLS,
            requests_limit: 10,
            worker_limit: DEFAULT_WORKER_LIMIT,
            fetch_timeout: 1,
            retry_enabled: true,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_delay: 30,
            retry_fill_ratio: 80,
            cache_enabled: true,
            cache_ttl: 30,
            log_filter: "info".to_string(),
        }
    }
}

impl MultiplexerConfig {
    /// Load from an optional TOML file, then apply `MULTIPLEXER_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let settings = builder
            .add_source(env)
            .build()
            .context("failed to read configuration")?;
        settings
            .try_deserialize()
            .context("failed to parse configuration")
    }

    /// Engine options derived from this configuration.
    pub fn options(&self) -> MultiplexerOptions {
        MultiplexerOptions {
            max_urls: self.max_urls,
            requests_limit: self.requests_limit,
            worker_limit: self.worker_limit,
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            retry: RetryOptions {
                enabled: self.retry_enabled,
                max_attempts: self.retry_max_attempts,
                delay: Duration::from_secs(self.retry_delay),
                fill_ratio_percent: self.retry_fill_ratio,
            },
        }
    }

    /// Cache TTL, or `None` when caching is disabled.
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_enabled.then(|| Duration::from_secs(self.cache_ttl))
    }
}
