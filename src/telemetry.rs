use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{default_filter},hyper=warn,reqwest=warn"))
        });

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("url multiplexer tracing initialized");
    });
}
