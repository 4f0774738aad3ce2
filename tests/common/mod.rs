// Shared fixtures: a scripted fetch source and an in-process upstream server.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use url_multiplexer::source::traits::FetchSource;

#[derive(Clone, Debug)]
pub enum Reply {
    Body(String),
    Error(String),
    /// Never completes.
    Hang,
    Panic,
}

/// Fake transport. Each URL replays its script; the last reply repeats once
/// the script runs out. Unscripted URLs answer with [`ScriptedSource::body_for`].
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.scripts.lock().insert(url.to_string(), replies.into());
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn body_for(url: &str) -> String {
        format!("body of {url} padded well past twenty bytes")
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(url) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Body(Self::body_for(url))),
            None => Reply::Body(Self::body_for(url)),
        }
    }
}

#[async_trait]
impl FetchSource for ScriptedSource {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        match self.next_reply(url) {
            Reply::Body(body) => Ok(Bytes::from(body)),
            Reply::Error(msg) => Err(anyhow!(msg)),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Reply::Panic => panic!("scripted panic for {url}"),
        }
    }
}

pub fn urls(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| format!("http://upstream.test/{n}")).collect()
}

/// Upstream with `/ok/{name}` (200, long body), `/short` (200, "tiny"),
/// `/missing` (404) and `/slow` (200 after two seconds).
pub async fn start_upstream() -> SocketAddr {
    async fn ok(Path(name): Path<String>) -> impl IntoResponse {
        (StatusCode::OK, format!("{name}:0123456789abcdefghijklmnopqrstuvwxyz"))
    }
    async fn short() -> impl IntoResponse {
        (StatusCode::OK, "tiny")
    }
    async fn missing() -> impl IntoResponse {
        (StatusCode::NOT_FOUND, "nope")
    }
    async fn slow() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_secs(2)).await;
        (StatusCode::OK, "eventually")
    }

    let app = Router::new()
        .route("/ok/{name}", get(ok))
        .route("/short", get(short))
        .route("/missing", get(missing))
        .route("/slow", get(slow));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}
