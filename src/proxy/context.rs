//! Per-request state shared across pipeline stages.
//!
//! # Ownership
//! ```text
//! LogicalRequest (one per inbound exchange, cheap to clone)
//!     ├── Arc<InboundRequest>   method/uri/headers + single-shot body
//!     ├── Arc<ProxyTarget>      fixed per proxy instance
//!     ├── Arc<ProxyOptions>     immutable
//!     ├── BodyDecision          resolved once
//!     └── Arc<BodyCache>        replay cache for this request only
//!
//! RequestContext (one per attempt)
//!     ├── LogicalRequest
//!     ├── OutboundRequest       built by stages 1-6
//!     ├── UpstreamResponse      filled by stage 7
//!     └── ClientResponse        filled by stages 8-10
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use tokio::sync::watch;
use uuid::Uuid;

use crate::proxy::body::{BodyCache, BodyDecision, MaterializedBody};
use crate::proxy::options::ProxyOptions;
use crate::proxy::target::ProxyTarget;
use crate::proxy::transport::Transport;

/// Fires when the originator of the inbound exchange goes away.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_aborted(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the exchange is aborted.
    ///
    /// Dropping the [`AbortHandle`] without aborting never resolves.
    pub async fn aborted(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|aborted| *aborted).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Host-side trigger for an [`AbortSignal`].
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx: Some(rx) })
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// The originating request as seen by the proxy.
pub struct InboundRequest {
    id: Uuid,
    parts: Parts,
    body: Mutex<Option<Body>>,
    abort: AbortSignal,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("id", &self.id)
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl InboundRequest {
    pub fn new(request: Request<Body>) -> Self {
        Self::with_abort(request, AbortSignal::never())
    }

    pub fn with_abort(request: Request<Body>, abort: AbortSignal) -> Self {
        let (parts, body) = request.into_parts();
        // Reuse the id assigned by the HTTP layer so log lines correlate.
        let id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .unwrap_or_else(Uuid::new_v4);
        Self {
            id,
            parts,
            body: Mutex::new(Some(body)),
            abort,
        }
    }

    /// Identifier of the logical request, used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    /// Path plus query, as sent by the client.
    pub fn path_and_query(&self) -> String {
        self.parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Take the body stream. Only the first caller gets it.
    pub fn take_body(&self) -> Option<Body> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Give the request back to the host, e.g. when the filter skips it.
    pub fn into_request(self) -> Request<Body> {
        let body = self
            .body
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(Body::empty);
        Request::from_parts(self.parts, body)
    }
}

/// Outbound request descriptor under construction.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
    pub headers: HeaderMap,
}

/// Status and headers of the upstream response, handed to decorators.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Produced locally by the dispatcher's timeout rather than the upstream.
    pub synthesized: bool,
}

impl UpstreamResponse {
    pub fn head(&self) -> ResponseHead {
        ResponseHead {
            status: self.status,
            headers: self.headers.clone(),
        }
    }
}

/// What will be written back to the inbound exchange.
#[derive(Debug, Clone, Default)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// State shared by every attempt of one logical request.
#[derive(Clone)]
pub struct LogicalRequest {
    pub(crate) inbound: Arc<InboundRequest>,
    pub(crate) target: Arc<ProxyTarget>,
    pub(crate) options: Arc<ProxyOptions>,
    pub(crate) transport: Transport,
    pub(crate) decision: BodyDecision,
    pub(crate) cache: Arc<BodyCache>,
}

impl LogicalRequest {
    pub fn new(
        inbound: Arc<InboundRequest>,
        target: Arc<ProxyTarget>,
        options: Arc<ProxyOptions>,
        transport: Transport,
    ) -> Self {
        let decision = options.parse_req_body.resolve(&inbound);
        Self {
            inbound,
            target,
            options,
            transport,
            decision,
            cache: Arc::new(BodyCache::new()),
        }
    }

    pub fn inbound(&self) -> &Arc<InboundRequest> {
        &self.inbound
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn decision(&self) -> BodyDecision {
        self.decision
    }

    pub fn cache(&self) -> &BodyCache {
        &self.cache
    }

    /// Container for the first attempt, reading the live inbound body.
    pub fn first_attempt(&self) -> RequestContext {
        RequestContext::new(self.clone(), None)
    }

    /// Fresh container for a replay, seeded with a cached body.
    pub fn replay(&self, body: MaterializedBody) -> RequestContext {
        RequestContext::new(self.clone(), Some(body))
    }
}

/// Per-attempt container threaded through the pipeline.
pub struct RequestContext {
    pub(crate) logical: LogicalRequest,
    pub(crate) seed: Option<MaterializedBody>,
    pub(crate) outbound: Option<OutboundRequest>,
    pub(crate) body: Option<MaterializedBody>,
    pub(crate) prepared_body: Option<Bytes>,
    pub(crate) upstream: Option<UpstreamResponse>,
    pub(crate) response: ClientResponse,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.logical.inbound.id())
            .field("outbound", &self.outbound)
            .field("body", &self.body)
            .field("upstream_status", &self.upstream.as_ref().map(|u| u.status))
            .field("status", &self.response.status)
            .finish()
    }
}

impl RequestContext {
    fn new(logical: LogicalRequest, seed: Option<MaterializedBody>) -> Self {
        Self {
            logical,
            seed,
            outbound: None,
            body: None,
            prepared_body: None,
            upstream: None,
            response: ClientResponse::default(),
        }
    }

    pub fn inbound(&self) -> &Arc<InboundRequest> {
        &self.logical.inbound
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.logical.options
    }

    pub fn decision(&self) -> BodyDecision {
        self.logical.decision
    }

    /// Whether this attempt replays a cached body.
    pub fn is_replay(&self) -> bool {
        self.seed.is_some()
    }

    pub fn outbound(&self) -> Option<&OutboundRequest> {
        self.outbound.as_ref()
    }

    /// Materialized (and possibly decorated) outbound body.
    pub fn body(&self) -> Option<&MaterializedBody> {
        self.body.as_ref()
    }

    /// Bytes written to the upstream, once finalized.
    pub fn prepared_body(&self) -> Option<&Bytes> {
        self.prepared_body.as_ref()
    }

    pub fn upstream(&self) -> Option<&UpstreamResponse> {
        self.upstream.as_ref()
    }

    /// Status that will be relayed to the client.
    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn response(&self) -> &ClientResponse {
        &self.response
    }

    pub fn into_response(self) -> Response<Body> {
        self.response.into_response()
    }
}
