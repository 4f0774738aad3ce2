// Engine: admission, per-batch worker pools, retry policy and the shared response cache.

pub mod cache;
pub mod gate;
pub mod multiplexer;
pub mod retry;
pub mod stats;
