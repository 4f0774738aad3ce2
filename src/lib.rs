pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;
pub mod telemetry;

pub use config::MultiplexerConfig;
pub use engine::cache::{NoopCache, ResponseCache, TtlCache};
pub use engine::gate::{AdmissionGate, AdmissionPermit, LoadProbe};
pub use engine::multiplexer::{preview, Multiplexer, MultiplexerOptions, RetryOptions};
pub use engine::retry::{LoadAwareRetry, RetryPolicy, SingleRetry};
pub use engine::stats::{StatsCollector, StatsSnapshot};
pub use error::{CacheError, FetchError};
pub use server::handler::MultiplexerServer;
pub use source::http_source::HttpSource;
pub use source::traits::FetchSource;
