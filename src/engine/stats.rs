// Live counters for admission, cache effectiveness and network activity.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub batches_accepted: u64,
    pub batches_rejected: u64,
    pub batches_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub network_attempts: u64,
    pub retries: u64,
    pub active_workers: u32,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    batches_accepted: AtomicU64,
    batches_rejected: AtomicU64,
    batches_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_attempts: AtomicU64,
    retries: AtomicU64,
    active_workers: AtomicU32,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.batches_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_attempt(&self) {
        self.network_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn network_attempts(&self) -> u64 {
        self.network_attempts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;
        let cache_hit_rate = if lookups > 0 {
            cache_hits as f64 / lookups as f64
        } else {
            0.0
        };

        StatsSnapshot {
            batches_accepted: self.batches_accepted.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            network_attempts: self.network_attempts(),
            retries: self.retries.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            cache_hit_rate,
        }
    }
}
