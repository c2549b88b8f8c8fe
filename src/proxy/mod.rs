//! Retrying reverse-proxy request pipeline.
//!
//! # Data Flow
//! ```text
//! host framework (axum middleware, fallback handler, or direct call)
//!     → Proxy::handle
//!         → filter            (skip: request handed back untouched)
//!         → LogicalRequest    (buffering decision resolved once)
//!         → engine.rs         (retry policy, backoff, replay)
//!             → pipeline.rs   (ten fixed stages per attempt)
//!                 → transport.rs (connect/overall timers, body relay)
//!     ← ClientResponse rendered into an axum Response
//! ```
//!
//! # Design Decisions
//! - Options are immutable and shared by `Arc`; per-request decisions live
//!   on the `LogicalRequest`, never on the options
//! - The replay cache and its cachability flag belong to one logical
//!   request only
//! - Dropping the future returned by [`Proxy::handle`] cancels the upstream
//!   attempt, which is how axum signals a client disconnect

pub mod body;
pub mod context;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod options;
pub mod pipeline;
pub mod replay;
pub mod target;
pub mod transport;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::observability::metrics;

pub use context::{AbortHandle, AbortSignal, InboundRequest, LogicalRequest, RequestContext};
pub use error::{ConnectErrorKind, ProxyError};
pub use hooks::{HookError, HookOutput};
pub use options::ProxyOptions;
pub use replay::{ReplayHandle, RetryStrategy};
pub use target::ProxyTarget;

/// Result of handing one inbound request to the proxy.
pub enum ProxyOutcome {
    /// The upstream response, ready to send to the client.
    Proxied(Response),
    /// The filter declined the request; it is returned unchanged.
    Skipped(Request<Body>),
}

impl std::fmt::Debug for ProxyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyOutcome::Proxied(response) => f.debug_tuple("Proxied").field(&response.status()).finish(),
            ProxyOutcome::Skipped(request) => f.debug_tuple("Skipped").field(request.uri()).finish(),
        }
    }
}

/// One proxy instance: a fixed upstream plus immutable options.
#[derive(Debug, Clone)]
pub struct Proxy {
    target: Arc<ProxyTarget>,
    options: Arc<ProxyOptions>,
    transport: transport::Transport,
}

impl Proxy {
    /// Create a proxy for `host` (`host`, `host:port` or a full URL).
    pub fn new(host: &str, options: ProxyOptions) -> Result<Self, ProxyError> {
        let target = ProxyTarget::parse(host)?;
        tracing::debug!(host = %target.host(), port = ?target.port(), secure = target.is_secure(), "Proxy created");
        Ok(Self {
            target: Arc::new(target),
            options: Arc::new(options),
            transport: transport::Transport::new()?,
        })
    }

    /// Create a proxy from a validated configuration file.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let options = ProxyOptions::from_config(&config.upstream, &config.retry)
            .map_err(|e| ProxyError::InvalidRequestOptions(e.to_string()))?;
        Self::new(&config.upstream.target, options)
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Proxy one request. Dropping the future aborts the exchange.
    pub async fn handle(&self, request: Request<Body>) -> Result<ProxyOutcome, ProxyError> {
        self.handle_with_abort(request, AbortSignal::never()).await
    }

    /// Proxy one request, additionally watching an explicit abort signal.
    pub async fn handle_with_abort(
        &self,
        request: Request<Body>,
        abort: AbortSignal,
    ) -> Result<ProxyOutcome, ProxyError> {
        let inbound = InboundRequest::with_abort(request, abort);
        if !self.options.accepts(&inbound) {
            tracing::trace!(request_id = %inbound.id(), "Filter declined request");
            return Ok(ProxyOutcome::Skipped(inbound.into_request()));
        }

        let start = Instant::now();
        let method = inbound.method().to_string();
        let span = tracing::info_span!(
            "proxy",
            request_id = %inbound.id(),
            method = %inbound.method(),
            path = %inbound.uri().path(),
        );
        let logical = LogicalRequest::new(
            Arc::new(inbound),
            self.target.clone(),
            self.options.clone(),
            self.transport.clone(),
        );

        let result = engine::execute_with_retry(logical).instrument(span.clone()).await;
        match result {
            Ok(ctx) => {
                metrics::record_request(&method, ctx.status().as_u16(), start);
                span.in_scope(|| {
                    tracing::debug!(status = ctx.status().as_u16(), elapsed = ?start.elapsed(), "Proxied request")
                });
                Ok(ProxyOutcome::Proxied(ctx.into_response()))
            }
            Err(error) => {
                metrics::record_request(&method, error.client_status().as_u16(), start);
                span.in_scope(|| tracing::warn!(error = %error, elapsed = ?start.elapsed(), "Proxy request failed"));
                Err(error)
            }
        }
    }
}

/// Middleware form: proxies accepted requests, passes skipped ones to `next`.
///
/// ```ignore
/// let app = Router::new()
///     .route("/health", get(|| async { "ok" }))
///     .layer(axum::middleware::from_fn_with_state(proxy, proxy_middleware));
/// ```
pub async fn proxy_middleware(State(proxy): State<Proxy>, request: Request, next: Next) -> Response {
    match proxy.handle(request).await {
        Ok(ProxyOutcome::Proxied(response)) => response,
        Ok(ProxyOutcome::Skipped(request)) => next.run(request).await,
        Err(error) => error.into_response(),
    }
}

/// Terminal handler form, e.g. as a router fallback. Skipped requests get 404.
pub async fn proxy_handler(State(proxy): State<Proxy>, request: Request) -> Response {
    match proxy.handle(request).await {
        Ok(ProxyOutcome::Proxied(response)) => response,
        Ok(ProxyOutcome::Skipped(_)) => (StatusCode::NOT_FOUND, "Not proxied").into_response(),
        Err(error) => error.into_response(),
    }
}
