// Batch fetch orchestration: a worker pool per admitted batch, fan-in of
// previews, and first-error cancellation of the whole batch.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::{NoopCache, ResponseCache, TtlCache};
use super::gate::{AdmissionGate, AdmissionPermit, LoadProbe};
use super::retry::{LoadAwareRetry, RetryPolicy, SingleRetry};
use super::stats::{StatsCollector, StatsSnapshot};
use crate::config::{
    MultiplexerConfig, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_URLS, DEFAULT_RETRY_DELAY,
    DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_WORKER_LIMIT, PREVIEW_BYTES,
};
use crate::error::{CacheError, FetchError};
use crate::source::http_source::HttpSource;
use crate::source::traits::FetchSource;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// When `false`, a failed URL gets exactly one immediate extra attempt.
    pub enabled: bool,
    /// Total attempts per URL, first attempt included.
    pub max_attempts: u32,
    pub delay: Duration,
    /// Load percentage at or above which retries are refused.
    pub fill_ratio_percent: i64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            fill_ratio_percent: 80,
        }
    }
}

/// Engine limits. Zero values are replaced by defaults in [`Multiplexer::new`].
#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    pub max_urls: usize,
    pub requests_limit: usize,
    pub worker_limit: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryOptions,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            max_urls: DEFAULT_MAX_URLS,
            requests_limit: 0,
            worker_limit: DEFAULT_WORKER_LIMIT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry: RetryOptions::default(),
        }
    }
}

pub struct Multiplexer {
    fetcher: Arc<UrlFetcher>,
    gate: Arc<AdmissionGate>,
    stats: Arc<StatsCollector>,
    max_urls: usize,
    worker_limit: usize,
}

impl Multiplexer {
    pub fn new(
        options: MultiplexerOptions,
        source: Arc<dyn FetchSource>,
        cache: Arc<dyn ResponseCache>,
    ) -> Self {
        let gate = Arc::new(AdmissionGate::new(options.requests_limit));
        let retry: Arc<dyn RetryPolicy> = if options.retry.enabled {
            Arc::new(LoadAwareRetry::new(
                options.retry.max_attempts,
                options.retry.delay,
                options.retry.fill_ratio_percent,
                Arc::clone(&gate) as Arc<dyn LoadProbe>,
            ))
        } else {
            Arc::new(SingleRetry)
        };
        let stats = Arc::new(StatsCollector::new());

        Self {
            fetcher: Arc::new(UrlFetcher {
                source,
                cache,
                retry,
                stats: Arc::clone(&stats),
                fetch_timeout: non_zero(options.fetch_timeout, DEFAULT_FETCH_TIMEOUT),
            }),
            gate,
            stats,
            max_urls: non_zero(options.max_urls, DEFAULT_MAX_URLS),
            worker_limit: non_zero(options.worker_limit, DEFAULT_WORKER_LIMIT),
        }
    }

    /// Build the production engine: reqwest transport, and a TTL cache bound
    /// to `lifecycle` unless caching is disabled. Must run inside a runtime.
    pub fn from_config(config: &MultiplexerConfig, lifecycle: CancellationToken) -> Result<Self> {
        let source = Arc::new(HttpSource::new()?);
        let cache: Arc<dyn ResponseCache> = match config.cache_ttl() {
            Some(ttl) => TtlCache::spawn(ttl, lifecycle),
            None => Arc::new(NoopCache),
        };
        info!(
            max_urls = config.max_urls,
            requests_limit = config.requests_limit,
            worker_limit = config.worker_limit,
            retry = config.retry_enabled,
            cache = config.cache_enabled,
            "multiplexer configured"
        );
        Ok(Self::new(config.options(), source, cache))
    }

    /// Try to admit one batch without waiting.
    pub fn admit(&self) -> Option<AdmissionPermit> {
        let permit = self.gate.try_acquire();
        if permit.is_some() {
            self.stats.record_accepted();
        } else {
            self.stats.record_rejected();
            warn!(
                capacity = self.gate.capacity(),
                "admission gate full; rejecting batch"
            );
        }
        permit
    }

    /// Admit and run a batch, holding the admission slot until it finishes.
    pub async fn submit(
        &self,
        parent: &CancellationToken,
        urls: Vec<String>,
    ) -> Result<HashMap<String, String>, FetchError> {
        let _permit = self.admit().ok_or(FetchError::AdmissionRejected)?;
        self.fetch_batch(parent, urls).await
    }

    /// Fetch every URL and map each to its preview.
    ///
    /// Fails with [`FetchError::InvalidInput`] for an empty batch or one
    /// longer than `max_urls`. Cancelling `parent` cancels every worker.
    pub async fn fetch_batch(
        &self,
        parent: &CancellationToken,
        urls: Vec<String>,
    ) -> Result<HashMap<String, String>, FetchError> {
        if urls.is_empty() {
            return Err(FetchError::InvalidInput("no urls provided".to_string()));
        }
        if urls.len() > self.max_urls {
            return Err(FetchError::InvalidInput(format!(
                "too many urls: {} (max {})",
                urls.len(),
                self.max_urls
            )));
        }

        let total = urls.len();
        debug!(urls = total, "batch started");
        // Counts the batch as failed unless it completes, including when the
        // caller drops this future mid-flight.
        let mut outcome = BatchOutcome::new(&self.stats);
        let result = self.run_batch(parent, urls).await;
        match &result {
            Ok(_) => {
                outcome.completed();
                debug!(urls = total, "batch completed");
            }
            Err(err) => warn!(urls = total, error = %err, "batch failed"),
        }
        result
    }

    async fn run_batch(
        &self,
        parent: &CancellationToken,
        urls: Vec<String>,
    ) -> Result<HashMap<String, String>, FetchError> {
        let total = urls.len();
        let batch = Arc::new(BatchControl::new(parent.child_token()));
        // Stragglers stop as soon as this call returns, whatever the outcome.
        let _cancel_on_exit = batch.token.clone().drop_guard();

        let queue = Arc::new(WorkQueue::new(urls));
        let (result_tx, mut result_rx) = mpsc::channel::<FetchedUrl>(total);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_limit.min(total) {
            workers.spawn(run_worker(
                worker_id,
                Arc::clone(&self.fetcher),
                Arc::clone(&queue),
                Arc::clone(&batch),
                result_tx.clone(),
            ));
        }
        drop(result_tx);

        let supervisor_batch = Arc::clone(&batch);
        tokio::spawn(async move {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    if err.is_panic() {
                        let panic_msg = panic_message(err.into_panic().as_ref());
                        error!(panic = %panic_msg, "fetch worker panicked");
                        supervisor_batch
                            .fail(FetchError::Internal(format!("worker panicked: {panic_msg}")));
                    }
                }
            }
            queue.close();
        });

        let mut previews = HashMap::with_capacity(total);
        let mut processed = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = batch.token.cancelled() => return Err(batch.take_cause()),
                received = result_rx.recv() => match received {
                    Some(FetchedUrl { url, preview }) => {
                        previews.insert(url, preview);
                        processed += 1;
                        if processed == total {
                            result_rx.close();
                            return Ok(previews);
                        }
                    }
                    None => {
                        return Err(batch.take_cause_or(FetchError::Internal(
                            "workers exited before the batch completed".to_string(),
                        )));
                    }
                },
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn max_urls(&self) -> usize {
        self.max_urls
    }
}

/// First `PREVIEW_BYTES` bytes of a body. A character split at the cut is
/// replaced with U+FFFD.
pub fn preview(body: &[u8]) -> String {
    let end = body.len().min(PREVIEW_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

struct FetchedUrl {
    url: String,
    preview: String,
}

/// Cancellation shared by one batch's workers, with the first failure kept as
/// the cause.
struct BatchControl {
    token: CancellationToken,
    cause: Mutex<Option<FetchError>>,
}

impl BatchControl {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cause: Mutex::new(None),
        }
    }

    fn fail(&self, err: FetchError) {
        {
            let mut cause = self.cause.lock();
            if cause.is_none() {
                *cause = Some(err);
            }
        }
        self.token.cancel();
    }

    fn take_cause(&self) -> FetchError {
        self.take_cause_or(FetchError::Cancelled)
    }

    fn take_cause_or(&self, fallback: FetchError) -> FetchError {
        self.cause.lock().take().unwrap_or(fallback)
    }
}

/// URLs of one batch, loaded up front.
struct WorkQueue {
    urls: Mutex<VecDeque<String>>,
}

impl WorkQueue {
    fn new(urls: Vec<String>) -> Self {
        Self {
            urls: Mutex::new(urls.into()),
        }
    }

    fn next(&self) -> Option<String> {
        self.urls.lock().pop_front()
    }

    /// Drop whatever was left behind by workers that stopped early.
    fn close(&self) {
        let mut urls = self.urls.lock();
        if !urls.is_empty() {
            debug!(abandoned = urls.len(), "work queue closed with pending urls");
        }
        urls.clear();
    }
}

async fn run_worker(
    worker_id: usize,
    fetcher: Arc<UrlFetcher>,
    queue: Arc<WorkQueue>,
    batch: Arc<BatchControl>,
    results: mpsc::Sender<FetchedUrl>,
) {
    let _active = ActiveWorker::enter(&fetcher.stats);

    loop {
        if batch.token.is_cancelled() {
            break;
        }
        let Some(url) = queue.next() else {
            break;
        };

        match fetcher.fetch(&batch.token, &url).await {
            Ok(body) => {
                let preview = preview(&body);
                if results.send(FetchedUrl { url, preview }).await.is_err() {
                    break;
                }
            }
            Err(FetchError::Cancelled) => break,
            Err(err) => {
                warn!(worker = worker_id, error = %err, "worker failed; cancelling batch");
                batch.fail(err);
                break;
            }
        }
    }
}

/// Keeps the active worker gauge right even when a worker panics.
struct ActiveWorker<'a>(&'a StatsCollector);

impl<'a> ActiveWorker<'a> {
    fn enter(stats: &'a StatsCollector) -> Self {
        stats.increment_workers();
        Self(stats)
    }
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        self.0.decrement_workers();
    }
}

/// Records a failed batch on drop unless marked completed.
struct BatchOutcome<'a> {
    stats: &'a StatsCollector,
    completed: bool,
}

impl<'a> BatchOutcome<'a> {
    fn new(stats: &'a StatsCollector) -> Self {
        Self {
            stats,
            completed: false,
        }
    }

    fn completed(&mut self) {
        self.completed = true;
    }
}

impl Drop for BatchOutcome<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.stats.record_failed();
        }
    }
}

/// Per-URL fetch shared by all workers of all batches.
struct UrlFetcher {
    source: Arc<dyn FetchSource>,
    cache: Arc<dyn ResponseCache>,
    retry: Arc<dyn RetryPolicy>,
    stats: Arc<StatsCollector>,
    fetch_timeout: Duration,
}

impl UrlFetcher {
    async fn fetch(&self, token: &CancellationToken, url: &str) -> Result<Bytes, FetchError> {
        match self.cache.get(url) {
            Ok(body) => {
                self.stats.record_cache_hit();
                debug!(url, "served from cache");
                return Ok(body);
            }
            Err(CacheError::NotFound) => self.stats.record_cache_miss(),
            Err(err) => {
                self.stats.record_cache_miss();
                debug!(url, error = %err, "cache lookup failed; fetching from network");
            }
        }

        let mut attempt = 0u32;
        loop {
            if token.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;
            self.stats.record_network_attempt();

            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                outcome = self.fetch_once(url) => outcome,
            };

            match outcome {
                Ok(body) => {
                    if let Err(err) = self.cache.set(url, body.clone()) {
                        warn!(url, error = %err, "failed to cache response");
                    }
                    return Ok(body);
                }
                Err(err) => {
                    warn!(url, attempt, error = %err, "fetch attempt failed");
                    if !self.retry.should_retry(token, attempt).await {
                        if token.is_cancelled() {
                            return Err(FetchError::Cancelled);
                        }
                        return Err(FetchError::upstream(url, err));
                    }
                    self.stats.record_retry();
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Bytes> {
        match tokio::time::timeout(self.fetch_timeout, self.source.fetch(url)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!(
                "request timed out after {}ms",
                self.fetch_timeout.as_millis()
            )),
        }
    }
}

fn non_zero<T: Default + PartialEq>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
