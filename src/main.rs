// url-multiplexer server binary.
//
//   MULTIPLEXER_MAX_URLS=10 url-multiplexer --config multiplexer.toml
//
// First Ctrl+C stops accepting connections and lets in-flight batches finish.
// A second Ctrl+C or SIGTERM cancels everything immediately.

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use url_multiplexer::config::MultiplexerConfig;
use url_multiplexer::engine::multiplexer::Multiplexer;
use url_multiplexer::server::handler::MultiplexerServer;
use url_multiplexer::telemetry::init_tracing;

/// Concurrent URL fetch multiplexer
#[derive(Parser, Debug)]
#[command(name = "url-multiplexer")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = MultiplexerConfig::load(args.config.as_deref())?;
    init_tracing(&config.log_filter);

    info!(version = env!("CARGO_PKG_VERSION"), "starting url multiplexer");

    // Cancelling root aborts every batch and ends the cache lifecycle.
    let root = CancellationToken::new();
    let multiplexer = Arc::new(Multiplexer::from_config(&config, root.clone())?);
    let server = MultiplexerServer::start(&config.bind_addr, multiplexer, root.clone()).await?;

    run_until_shutdown(server, root).await?;
    info!("url multiplexer stopped");
    Ok(())
}

async fn run_until_shutdown(server: MultiplexerServer, root: CancellationToken) -> Result<()> {
    let graceful = server.shutdown_token();
    let mut stopped = pin!(server.join());
    let mut terminate = pin!(terminate_signal());
    let mut soft_shutdown = false;

    loop {
        tokio::select! {
            result = &mut stopped => {
                root.cancel();
                return result;
            }
            _ = tokio::signal::ctrl_c() => {
                if soft_shutdown {
                    warn!("received second interrupt, performing hard shutdown");
                    root.cancel();
                    return stopped.await;
                } else {
                    info!("received interrupt, performing soft shutdown");
                    soft_shutdown = true;
                    graceful.cancel();
                }
            }
            _ = &mut terminate => {
                info!("received SIGTERM, shutting down");
                root.cancel();
                return stopped.await;
            }
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
