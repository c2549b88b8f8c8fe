//! Retry engine behaviour against live mock upstreams.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use proxy_relay::proxy::body::MAX_CACHEABLE_BODY_SIZE;
use proxy_relay::proxy::transport::X_TIMEOUT_REASON;
use proxy_relay::proxy::{AbortHandle, ConnectErrorKind, HookOutput, ReplayHandle};
use proxy_relay::resilience::retries::RetryOptions;
use proxy_relay::{Proxy, ProxyError, ProxyOptions, ProxyOutcome};

mod common;
use common::Reply;

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, json: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

async fn proxied(proxy: &Proxy, request: Request<Body>) -> Result<axum::response::Response, ProxyError> {
    match proxy.handle(request).await? {
        ProxyOutcome::Proxied(response) => Ok(response),
        ProxyOutcome::Skipped(_) => panic!("request unexpectedly skipped"),
    }
}

fn fast_retry(retries: u32) -> RetryOptions {
    RetryOptions {
        retries: Some(retries),
        min_timeout: Some(Duration::from_millis(10)),
        max_timeout: Some(Duration::from_millis(20)),
        ..RetryOptions::default()
    }
}

#[tokio::test]
async fn ok_response_makes_one_attempt() {
    let backend = common::start_mock_backend("hello").await;
    let proxy = Proxy::new(&backend.url(), ProxyOptions::new().retry()).unwrap();

    let started = Instant::now();
    let response = proxied(&proxy, get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(common::body_string(response).await, "hello");
    assert_eq!(backend.hits(), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn server_errors_exhaust_retry_budget() {
    let backend = common::start_programmable_backend(|_| async { Reply::text(500, "boom") }).await;
    let options = ProxyOptions::new().retry_with(RetryOptions {
        retries: Some(2),
        min_timeout: Some(Duration::from_millis(50)),
        max_timeout: Some(Duration::from_millis(100)),
        ..RetryOptions::default()
    });
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let started = Instant::now();
    let response = proxied(&proxy, get("/")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 3);
    // Smallest jittered delays: 50 * 0.1 + 100 * 0.1.
    assert!(elapsed >= Duration::from_millis(15), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn transient_failures_recover() {
    let backend = common::start_programmable_backend(|hit| async move {
        if hit < 2 {
            Reply::text(503, "Service Unavailable")
        } else {
            Reply::text(200, "Success")
        }
    })
    .await;
    let proxy = Proxy::new(&backend.url(), ProxyOptions::new().retry_with(fast_retry(3))).unwrap();

    let response = proxied(&proxy, post_json("/orders", r#"{"id":7}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(common::body_string(response).await, "Success");
    assert_eq!(backend.hits(), 3);

    let bodies: Vec<_> = backend.requests().into_iter().map(|r| r.body).collect();
    assert!(bodies.iter().all(|b| b.as_ref() == br#"{"id":7}"#));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(404) }).await;
    let proxy = Proxy::new(&backend.url(), ProxyOptions::new().retry_with(fast_retry(3))).unwrap();

    let response = proxied(&proxy, get("/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn refused_connection_backs_off_then_fails() {
    let addr = common::refused_addr();
    let proxy = Proxy::new(&format!("http://{addr}"), ProxyOptions::new().retry()).unwrap();

    let started = Instant::now();
    let err = proxied(&proxy, get("/")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
    assert_eq!(err.client_status(), StatusCode::BAD_GATEWAY);
    // Three backoffs at their jitter floor: 100 + 200 + 400 ms.
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn upstream_reset_is_retried() {
    let (addr, hits) = common::start_resetting_backend().await;
    let proxy = Proxy::new(&format!("http://{addr}"), ProxyOptions::new().retry_with(fast_retry(2))).unwrap();

    let err = proxied(&proxy, get("/")).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_abort_cancels_backoff() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(500) }).await;
    // First delay is drawn from [500ms, 5s).
    let options = ProxyOptions::new().retry_with(RetryOptions {
        retries: Some(3),
        min_timeout: Some(Duration::from_millis(5_000)),
        ..RetryOptions::default()
    });
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let (handle, signal) = AbortHandle::new();
    let watched = backend.clone();
    tokio::spawn(async move {
        while watched.hits() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    });

    let started = Instant::now();
    let err = proxy.handle_with_abort(get("/"), signal).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ProxyError::ClientAborted), "{err}");
    assert_eq!(backend.hits(), 1);
    assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn synthesized_gateway_timeout_is_retried() {
    let (addr, hits) = common::start_silent_backend().await;
    let options = ProxyOptions::new()
        .timeout(Duration::from_millis(50))
        .retry_with(fast_retry(2));
    let proxy = Proxy::new(&format!("http://{addr}"), options).unwrap();

    let response = proxied(&proxy, get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(response.headers().contains_key(X_TIMEOUT_REASON));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn disabled_retry_makes_one_attempt() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(502) }).await;
    let proxy = Proxy::new(&backend.url(), ProxyOptions::new()).unwrap();

    let response = proxied(&proxy, get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn streaming_mode_bypasses_retry() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(500) }).await;
    let options = ProxyOptions::new().parse_req_body(false).retry_with(fast_retry(3));
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let response = proxied(&proxy, post_json("/upload", r#"{"chunk":1}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 1);
    assert_eq!(backend.requests()[0].body.as_ref(), br#"{"chunk":1}"#);
}

#[tokio::test]
async fn streaming_predicate_is_evaluated_once() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(500) }).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let options = ProxyOptions::new()
        .parse_req_body_with(move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            req.method() != Method::PUT
        })
        .retry_with(fast_retry(2));
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let response = proxied(&proxy, get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_time_budget_stops_retries() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(503) }).await;
    let options = ProxyOptions::new().retry_with(RetryOptions {
        retries: Some(5),
        max_retry_time: Some(Duration::from_millis(100)),
        min_timeout: Some(Duration::from_millis(2_000)),
        max_timeout: None,
    });
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let started = Instant::now();
    let response = proxied(&proxy, get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(backend.hits(), 1);
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

#[tokio::test]
async fn oversized_body_disables_retry() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(500) }).await;
    let options = ProxyOptions::new()
        .limit(MAX_CACHEABLE_BODY_SIZE * 2)
        .retry_with(fast_retry(3));
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let body = vec![b'a'; MAX_CACHEABLE_BODY_SIZE + 1024];
    let request = Request::builder()
        .method(Method::POST)
        .uri("/bulk")
        .header("content-type", "application/octet-stream")
        .body(Body::from(body))
        .unwrap();

    let response = proxied(&proxy, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 1);
}

#[tokio::test]
async fn custom_strategy_replays_identical_body() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(500) }).await;
    let options = ProxyOptions::new().retry_strategy(|handle: ReplayHandle, _inbound| {
        HookOutput::future(async move {
            let mut last = handle.execute().await;
            for _ in 0..2 {
                match &last {
                    Ok(ctx) if ctx.status().is_server_error() => last = handle.execute().await,
                    _ => break,
                }
            }
            last
        })
    });
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let sent = r#"{"task":"sync","n":3,"big":12345678901234567890123,"ratio":1.10}"#;
    let response = proxied(&proxy, post_json("/jobs", sent)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.hits(), 3);

    for request in backend.requests() {
        assert_eq!(request.body.as_ref(), sent.as_bytes());
    }
}

#[tokio::test]
async fn custom_strategy_immediate_and_deferred_errors_match() {
    let backend = common::start_mock_backend("unused").await;

    let immediate = Proxy::new(
        &backend.url(),
        ProxyOptions::new().retry_strategy(|_handle: ReplayHandle, _inbound| {
            HookOutput::fail(ProxyError::InvalidRequestOptions("policy refused".into()))
        }),
    )
    .unwrap();
    let deferred = Proxy::new(
        &backend.url(),
        ProxyOptions::new().retry_strategy(|_handle: ReplayHandle, _inbound| {
            HookOutput::future(async { Err(ProxyError::InvalidRequestOptions("policy refused".into())) })
        }),
    )
    .unwrap();

    let a = proxied(&immediate, get("/")).await.unwrap_err();
    let b = proxied(&deferred, get("/")).await.unwrap_err();
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn custom_strategy_cannot_replay_oversized_body() {
    let backend = common::start_programmable_backend(|_| async { Reply::status(500) }).await;
    let options = ProxyOptions::new()
        .limit(MAX_CACHEABLE_BODY_SIZE * 2)
        .retry_strategy(|handle: ReplayHandle, _inbound| {
            HookOutput::future(async move {
                let first = handle.execute().await?;
                assert!(first.status().is_server_error());
                handle.execute().await
            })
        });
    let proxy = Proxy::new(&backend.url(), options).unwrap();

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/blob")
        .body(Body::from(vec![0u8; MAX_CACHEABLE_BODY_SIZE + 1]))
        .unwrap();
    let err = proxied(&proxy, request).await.unwrap_err();
    assert!(matches!(err, ProxyError::ReplayUnavailable));
    assert_eq!(backend.hits(), 1);
}
