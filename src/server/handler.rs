// Axum request handlers: translate `/fetch` requests into admitted batches.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::multiplexer::Multiplexer;
use crate::error::FetchError;

#[derive(Clone)]
pub struct AppState {
    multiplexer: Arc<Multiplexer>,
    root: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    urls: Vec<String>,
}

pub struct MultiplexerServer {
    addr: SocketAddr,
    graceful: CancellationToken,
    handle: JoinHandle<()>,
}

impl MultiplexerServer {
    /// Bind `bind_addr` and serve in the background.
    ///
    /// Every batch is cancelled when `root` is cancelled, which also stops the
    /// server. [`MultiplexerServer::shutdown`] only stops accepting new
    /// connections and lets in-flight requests finish.
    pub async fn start(
        bind_addr: &str,
        multiplexer: Arc<Multiplexer>,
        root: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let graceful = CancellationToken::new();
        let app = router(multiplexer, root.clone());

        let stop = graceful.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = root.cancelled() => {}
                    }
                })
                .await;
            if let Err(e) = result {
                error!("http server error: {}", e);
            }
        });

        info!(%addr, "multiplexer listening");
        Ok(Self {
            addr,
            graceful,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Loopback URL for `path` on this server, e.g. `/fetch`.
    pub fn url_for(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port(), path)
    }

    /// Stop accepting connections; in-flight requests run to completion.
    pub fn shutdown(&self) {
        self.graceful.cancel();
    }

    /// Token that triggers [`MultiplexerServer::shutdown`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.graceful.clone()
    }

    /// Wait for the server task to exit.
    pub async fn join(self) -> Result<()> {
        self.handle.await.context("http server task failed")
    }
}

pub fn router(multiplexer: Arc<Multiplexer>, root: CancellationToken) -> Router {
    Router::new()
        .route("/fetch", post(fetch_handler))
        .route("/stats", get(stats_handler))
        .with_state(AppState { multiplexer, root })
}

/// POST /fetch with body `{"urls": [...]}`, responds with URL → preview.
async fn fetch_handler(State(state): State<AppState>, body: Bytes) -> Response {
    // Admission comes first: a full gate rejects without parsing the batch.
    let Some(_permit) = state.multiplexer.admit() else {
        return error_response(&FetchError::AdmissionRejected);
    };

    let request: FetchRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("rejecting malformed fetch request: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid JSON format").into_response();
        }
    };

    // Dropping this handler (client gone) cancels the batch.
    let token = state.root.child_token();
    let _cancel_on_drop = token.clone().drop_guard();

    match state.multiplexer.fetch_batch(&token, request.urls).await {
        Ok(previews) => {
            (StatusCode::OK, Json::<HashMap<String, String>>(previews)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// GET /stats, a counters snapshot.
async fn stats_handler(State(state): State<AppState>) -> Response {
    Json(state.multiplexer.stats()).into_response()
}

fn error_response(err: &FetchError) -> Response {
    (status_for(err), err.to_string()).into_response()
}

fn status_for(err: &FetchError) -> StatusCode {
    match err {
        FetchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        FetchError::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
        FetchError::Upstream { .. } | FetchError::Cancelled | FetchError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
