// In-memory response cache with TTL expiry and a one-way availability cutover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CACHE_TTL_FLOOR;
use crate::error::CacheError;

/// Body store consulted by workers before going to the network.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Bytes, CacheError>;
    fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError>;
}

struct CacheEntry {
    body: Bytes,
    fetched_at: Instant,
}

pub struct TtlCache {
    data: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    available: AtomicBool,
}

impl TtlCache {
    /// Create a cache and spawn its sweep task on the current runtime.
    ///
    /// The sweep runs once per `ttl`. When `lifecycle` is cancelled the store
    /// is discarded and every later call fails with [`CacheError::Unavailable`].
    /// A zero `ttl` is replaced by [`CACHE_TTL_FLOOR`].
    pub fn spawn(ttl: Duration, lifecycle: CancellationToken) -> Arc<Self> {
        let cache = Arc::new(Self::new(ttl));
        let sweeper = Arc::clone(&cache);
        tokio::spawn(async move { sweeper.run_sweeper(lifecycle).await });
        cache
    }

    fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { CACHE_TTL_FLOOR } else { ttl };
        Self {
            data: RwLock::new(HashMap::new()),
            ttl,
            available: AtomicBool::new(true),
        }
    }

    async fn run_sweeper(&self, lifecycle: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.ttl, self.ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => {
                    self.shut_down();
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        debug!(evicted, "cache sweep evicted stale entries");
                    }
                }
            }
        }
    }

    /// Evict every entry older than the TTL. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let mut data = self.data.write();
        if !self.is_available() {
            return 0;
        }
        let before = data.len();
        data.retain(|_, entry| entry.fetched_at.elapsed() <= self.ttl);
        before - data.len()
    }

    fn shut_down(&self) {
        let mut data = self.data.write();
        self.available.store(false, Ordering::Release);
        *data = HashMap::new();
        info!("response cache unavailable: lifecycle ended");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for TtlCache {
    fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        {
            let data = self.data.read();
            if !self.is_available() {
                return Err(CacheError::Unavailable);
            }
            match data.get(key) {
                None => return Err(CacheError::NotFound),
                Some(entry) if entry.fetched_at.elapsed() <= self.ttl => {
                    return Ok(entry.body.clone());
                }
                Some(_) => {}
            }
        }

        // Stale: evict under the exclusive lock. A concurrent `set` may have
        // refreshed the entry in between, so check the age again.
        let mut data = self.data.write();
        if !self.is_available() {
            return Err(CacheError::Unavailable);
        }
        if let Some(entry) = data.get(key) {
            if entry.fetched_at.elapsed() <= self.ttl {
                return Ok(entry.body.clone());
            }
            data.remove(key);
            debug!(url = key, "evicted stale cache entry on read");
        }
        Err(CacheError::NotFound)
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        let mut data = self.data.write();
        if !self.is_available() {
            return Err(CacheError::Unavailable);
        }
        data.insert(
            key.to_string(),
            CacheEntry {
                body: value,
                fetched_at: Instant::now(),
            },
        );
        Ok(())
    }
}

/// Cache used when caching is disabled: every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl ResponseCache for NoopCache {
    fn get(&self, _key: &str) -> Result<Bytes, CacheError> {
        Err(CacheError::NotFound)
    }

    fn set(&self, _key: &str, _value: Bytes) -> Result<(), CacheError> {
        Ok(())
    }
}
