//! Request identification.
//!
//! Every inbound request gets an `x-request-id` (kept if the client sent
//! one), echoed on the response and forwarded upstream with the other
//! headers. The proxy reuses it as its logical request id when it parses
//! as a UUID.

use axum::body::Body;
use axum::http::{HeaderName, Request};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::Span;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Assigns a UUID v4 request id when the header is absent.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid)
}

/// Copies the request id onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(X_REQUEST_ID)
}

/// Span for the trace layer, carrying the request id.
pub fn request_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    tracing::info_span!(
        "http",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
    )
}
