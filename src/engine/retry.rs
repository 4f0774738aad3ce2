// Load-gated fixed-delay retry policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gate::LoadProbe;
use crate::config::{DEFAULT_RETRY_DELAY, DEFAULT_RETRY_FILL_RATIO, DEFAULT_RETRY_MAX_ATTEMPTS};

#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Called after failed attempt number `attempt` (1-based). Returns `true`
    /// once the caller may try again; any waiting happens inside this call.
    async fn should_retry(&self, token: &CancellationToken, attempt: u32) -> bool;
}

/// Retries after a fixed delay while the system is below its fill ratio.
pub struct LoadAwareRetry {
    max_attempts: u32,
    delay: Duration,
    fill_ratio: f64,
    load: Arc<dyn LoadProbe>,
}

impl LoadAwareRetry {
    /// Zero `max_attempts` or `delay` fall back to defaults. A fill ratio
    /// outside `0..=100` percent is replaced by the default 80%.
    pub fn new(
        max_attempts: u32,
        delay: Duration,
        fill_ratio_percent: i64,
        load: Arc<dyn LoadProbe>,
    ) -> Self {
        let max_attempts = if max_attempts == 0 {
            DEFAULT_RETRY_MAX_ATTEMPTS
        } else {
            max_attempts
        };
        let delay = if delay.is_zero() {
            DEFAULT_RETRY_DELAY
        } else {
            delay
        };
        let fill_ratio = if (0..=100).contains(&fill_ratio_percent) {
            fill_ratio_percent as f64 / 100.0
        } else {
            warn!(
                fill_ratio_percent,
                default = DEFAULT_RETRY_FILL_RATIO,
                "invalid retry fill ratio, using default"
            );
            DEFAULT_RETRY_FILL_RATIO
        };
        Self {
            max_attempts,
            delay,
            fill_ratio,
            load,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn fill_ratio(&self) -> f64 {
        self.fill_ratio
    }
}

#[async_trait]
impl RetryPolicy for LoadAwareRetry {
    async fn should_retry(&self, token: &CancellationToken, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        let load_ratio = self.load.load_ratio();
        if load_ratio >= self.fill_ratio {
            debug!(
                attempt,
                load_ratio,
                fill_ratio = self.fill_ratio,
                "retry refused under load"
            );
            return false;
        }

        debug!(
            attempt,
            load_ratio,
            delay_ms = self.delay.as_millis() as u64,
            "waiting before retry"
        );
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }
}

/// Policy used when retries are disabled: one immediate extra attempt, no more.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRetry;

#[async_trait]
impl RetryPolicy for SingleRetry {
    async fn should_retry(&self, _token: &CancellationToken, attempt: u32) -> bool {
        attempt < 2
    }
}
