// Non-blocking admission control for batches; doubles as the load signal for retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DEFAULT_REQUESTS_LIMIT;

/// Instantaneous load reading consulted by the retry policy.
pub trait LoadProbe: Send + Sync {
    /// Occupancy divided by capacity, in `[0.0, 1.0]`.
    fn load_ratio(&self) -> f64;
}

#[derive(Debug)]
pub struct AdmissionGate {
    capacity: usize,
    occupied: AtomicUsize,
}

impl AdmissionGate {
    /// A zero `capacity` is replaced by [`DEFAULT_REQUESTS_LIMIT`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_REQUESTS_LIMIT
        } else {
            capacity
        };
        Self {
            capacity,
            occupied: AtomicUsize::new(0),
        }
    }

    /// Take a slot without waiting. Returns `None` when the gate is full.
    ///
    /// The slot is released when the returned permit is dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                gate: Arc::clone(self),
            })
    }

    fn release(&self) {
        self.occupied.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }
}

impl LoadProbe for AdmissionGate {
    fn load_ratio(&self) -> f64 {
        self.occupied() as f64 / self.capacity as f64
    }
}

/// One admitted batch. Releases its slot on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
