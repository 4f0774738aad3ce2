mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use url_multiplexer::engine::cache::{NoopCache, ResponseCache, TtlCache};
use url_multiplexer::engine::multiplexer::{Multiplexer, MultiplexerOptions, RetryOptions};
use url_multiplexer::error::FetchError;

use common::{urls, Reply, ScriptedSource};

fn options(requests_limit: usize, retry: RetryOptions) -> MultiplexerOptions {
    MultiplexerOptions {
        max_urls: 20,
        requests_limit,
        worker_limit: 4,
        fetch_timeout: Duration::from_secs(1),
        retry,
    }
}

fn retry_enabled(delay: Duration) -> RetryOptions {
    RetryOptions {
        enabled: true,
        max_attempts: 3,
        delay,
        fill_ratio_percent: 80,
    }
}

fn retry_disabled() -> RetryOptions {
    RetryOptions {
        enabled: false,
        ..RetryOptions::default()
    }
}

fn multiplexer(source: &Arc<ScriptedSource>, opts: MultiplexerOptions) -> Multiplexer {
    Multiplexer::new(opts, source.clone(), Arc::new(NoopCache))
}

#[tokio::test]
async fn test_batch_maps_every_url_to_preview() {
    let source = ScriptedSource::new();
    let batch = urls(&["a", "b", "c", "d", "e", "f"]);
    source.script(&batch[0], vec![Reply::Body("0123456789abcdefghijKLMNOP".into())]);
    source.script(&batch[1], vec![Reply::Body("short".into())]);
    let mux = multiplexer(&source, options(10, retry_disabled()));

    let result = mux
        .fetch_batch(&CancellationToken::new(), batch.clone())
        .await
        .unwrap();

    assert_eq!(result.len(), batch.len());
    assert_eq!(result[&batch[0]], "0123456789abcdefghij");
    assert_eq!(result[&batch[1]], "short");
    for url in &batch[2..] {
        let body = ScriptedSource::body_for(url);
        assert_eq!(result[url], body[..20]);
    }
}

#[tokio::test]
async fn test_duplicate_urls_complete_without_stalling() {
    let source = ScriptedSource::new();
    let batch = urls(&["a", "a", "b"]);
    let mux = multiplexer(&source, options(10, retry_disabled()));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        mux.fetch_batch(&CancellationToken::new(), batch.clone()),
    )
    .await
    .expect("batch with duplicates must not stall")
    .unwrap();

    assert_eq!(result.len(), 2);
    assert!(result.contains_key(&batch[0]));
    assert!(result.contains_key(&batch[2]));
}

#[tokio::test]
async fn test_invalid_batch_sizes_rejected() {
    let source = ScriptedSource::new();
    let mux = multiplexer(&source, options(10, retry_disabled()));
    let token = CancellationToken::new();

    let empty = mux.fetch_batch(&token, Vec::new()).await;
    assert!(matches!(empty, Err(FetchError::InvalidInput(_))));

    let names: Vec<String> = (0..21).map(|i| i.to_string()).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let too_many = mux.fetch_batch(&token, urls(&names)).await;
    assert!(matches!(too_many, Err(FetchError::InvalidInput(_))));

    let exactly_max = mux.fetch_batch(&token, urls(&names[..20])).await;
    assert_eq!(exactly_max.unwrap().len(), 20);
    assert_eq!(source.total_calls(), 20);
}

#[tokio::test]
async fn test_one_failing_url_fails_whole_batch() {
    let source = ScriptedSource::new();
    let batch = urls(&["one", "two", "three"]);
    source.script(&batch[1], vec![Reply::Error("connection refused".into())]);
    let mux = multiplexer(&source, options(10, retry_disabled()));

    let err = mux
        .fetch_batch(&CancellationToken::new(), batch.clone())
        .await
        .unwrap_err();

    match err {
        FetchError::Upstream { url, .. } => assert_eq!(url, batch[1]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mux.stats().batches_failed, 1);
}

#[tokio::test]
async fn test_disabled_retry_allows_one_extra_attempt() {
    let source = ScriptedSource::new();
    let batch = urls(&["flaky"]);
    source.script(
        &batch[0],
        vec![Reply::Error("reset".into()), Reply::Body("second time lucky".into())],
    );
    let mux = multiplexer(&source, options(10, retry_disabled()));

    let result = mux
        .fetch_batch(&CancellationToken::new(), batch.clone())
        .await
        .unwrap();
    assert_eq!(result[&batch[0]], "second time lucky");
    assert_eq!(source.calls(&batch[0]), 2);

    let stubborn = urls(&["stubborn"]);
    source.script(&stubborn[0], vec![Reply::Error("reset".into())]);
    assert!(mux
        .fetch_batch(&CancellationToken::new(), stubborn.clone())
        .await
        .is_err());
    assert_eq!(source.calls(&stubborn[0]), 2);
}

#[tokio::test]
async fn test_retry_waits_between_attempts_when_lightly_loaded() {
    let source = ScriptedSource::new();
    let batch = urls(&["eventually"]);
    source.script(
        &batch[0],
        vec![
            Reply::Error("HTTP 503".into()),
            Reply::Error("HTTP 503".into()),
            Reply::Body("third attempt body".into()),
        ],
    );
    let delay = Duration::from_millis(200);
    let mux = multiplexer(&source, options(10, retry_enabled(delay)));

    let started = Instant::now();
    let result = mux
        .submit(&CancellationToken::new(), batch.clone())
        .await
        .unwrap();

    assert_eq!(result[&batch[0]], "third attempt body");
    assert_eq!(source.calls(&batch[0]), 3);
    assert!(started.elapsed() >= delay * 2);
    assert_eq!(mux.stats().retries, 2);
}

#[tokio::test]
async fn test_retry_refused_under_load() {
    let source = ScriptedSource::new();
    let batch = urls(&["busy"]);
    source.script(
        &batch[0],
        vec![Reply::Error("HTTP 503".into()), Reply::Body("never".into())],
    );
    // One slot: the batch itself fills the gate, so the load ratio is 1.0.
    let mux = multiplexer(&source, options(1, retry_enabled(Duration::from_secs(30))));

    let started = Instant::now();
    let err = mux
        .submit(&CancellationToken::new(), batch.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Upstream { .. }));
    assert_eq!(source.calls(&batch[0]), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_retries_exhausted_after_max_attempts() {
    let source = ScriptedSource::new();
    let batch = urls(&["down"]);
    source.script(&batch[0], vec![Reply::Error("HTTP 500".into())]);
    let mux = multiplexer(&source, options(10, retry_enabled(Duration::from_millis(20))));

    let err = mux
        .submit(&CancellationToken::new(), batch.clone())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("HTTP 500"));
    assert_eq!(source.calls(&batch[0]), 3);
}

#[tokio::test]
async fn test_admission_rejects_batch_beyond_limit() {
    let source = ScriptedSource::new();
    let hanging = urls(&["hang"]);
    source.script(&hanging[0], vec![Reply::Hang]);
    let mux = Arc::new(multiplexer(&source, options(2, retry_disabled())));
    let token = CancellationToken::new();

    let mut running = Vec::new();
    for _ in 0..2 {
        let mux = Arc::clone(&mux);
        let token = token.clone();
        let batch = hanging.clone();
        running.push(tokio::spawn(async move { mux.submit(&token, batch).await }));
    }
    while mux.gate().occupied() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    let rejected = mux.submit(&token, urls(&["other"])).await;
    assert!(matches!(rejected, Err(FetchError::AdmissionRejected)));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(source.calls(&urls(&["other"])[0]), 0);

    token.cancel();
    for handle in running {
        assert!(matches!(handle.await.unwrap(), Err(FetchError::Cancelled)));
    }
    assert_eq!(mux.gate().occupied(), 0);
    assert_eq!(mux.stats().batches_rejected, 1);
}

#[tokio::test]
async fn test_parent_cancellation_stops_batch() {
    let source = ScriptedSource::new();
    let batch = urls(&["hang", "fine"]);
    source.script(&batch[0], vec![Reply::Hang]);
    let mux = multiplexer(&source, options(10, retry_disabled()));
    let parent = CancellationToken::new();

    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), mux.fetch_batch(&parent, batch))
        .await
        .expect("cancellation must end the batch");
    assert!(matches!(result, Err(FetchError::Cancelled)));
}

#[tokio::test]
async fn test_attempt_timeout_counts_as_failure() {
    let source = ScriptedSource::new();
    let batch = urls(&["hang"]);
    source.script(&batch[0], vec![Reply::Hang]);
    let mut opts = options(10, retry_disabled());
    opts.fetch_timeout = Duration::from_millis(50);
    let mux = multiplexer(&source, opts);

    let err = mux
        .fetch_batch(&CancellationToken::new(), batch.clone())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(source.calls(&batch[0]), 2);
}

#[tokio::test]
async fn test_worker_panic_fails_batch() {
    let source = ScriptedSource::new();
    let batch = urls(&["boom"]);
    source.script(&batch[0], vec![Reply::Panic]);
    let mux = multiplexer(&source, options(10, retry_disabled()));

    let err = mux
        .fetch_batch(&CancellationToken::new(), batch)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Internal(_)));
}

#[tokio::test]
async fn test_cached_body_served_without_network() {
    let source = ScriptedSource::new();
    let lifecycle = CancellationToken::new();
    let cache = TtlCache::spawn(Duration::from_secs(30), lifecycle.clone());
    let mux = Multiplexer::new(options(10, retry_disabled()), source.clone(), cache);
    let batch = urls(&["cached"]);

    let first = mux
        .fetch_batch(&CancellationToken::new(), batch.clone())
        .await
        .unwrap();
    let second = mux
        .fetch_batch(&CancellationToken::new(), batch.clone())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(source.calls(&batch[0]), 1);
    assert_eq!(mux.stats().cache_hits, 1);
    lifecycle.cancel();
}

#[tokio::test]
async fn test_unavailable_cache_falls_back_to_network() {
    let source = ScriptedSource::new();
    let lifecycle = CancellationToken::new();
    let cache = TtlCache::spawn(Duration::from_secs(30), lifecycle.clone());
    let mux = Multiplexer::new(options(10, retry_disabled()), source.clone(), cache.clone());
    let batch = urls(&["uncached"]);

    lifecycle.cancel();
    while cache.is_available() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for _ in 0..2 {
        mux.fetch_batch(&CancellationToken::new(), batch.clone())
            .await
            .unwrap();
    }
    assert_eq!(source.calls(&batch[0]), 2);
    assert!(cache.get(&batch[0]).is_err());
}
