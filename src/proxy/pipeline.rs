//! The fixed, ordered stage sequence of one proxy attempt.
//!
//! # Stages
//! ```text
//!  1. build_proxy_req            skeleton + materialized body
//!  2. resolve_proxy_host         host/port/transport
//!  3. decorate_proxy_req_opts    user hook
//!  4. resolve_proxy_req_path     default: inbound path verbatim
//!  5. decorate_proxy_req_body    user hook, buffered mode only
//!  6. prepare_proxy_req          content-length / accept-charset
//!  7. send_proxy_request         transport dispatcher
//!  8. copy_proxy_res_headers     strip + user header hook
//!  9. decorate_user_res          user body hook
//! 10. send_user_res              final status/headers/body
//! ```
//!
//! Order is fixed. Any stage failure aborts the rest of the attempt and is
//! returned to the retry engine.

use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::proxy::body::{materialize, CacheOutcome};
use crate::proxy::context::{ClientResponse, OutboundRequest, RequestContext};
use crate::proxy::error::ProxyError;
use crate::proxy::transport::DispatchBody;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// Run every stage once.
pub async fn execute(ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let ctx = build_proxy_req(ctx).await?;
    let ctx = resolve_proxy_host(ctx)?;
    let ctx = decorate_proxy_req_opts(ctx).await?;
    let ctx = resolve_proxy_req_path(ctx).await?;
    let ctx = decorate_proxy_req_body(ctx).await?;
    let ctx = prepare_proxy_req(ctx)?;
    let ctx = send_proxy_request(ctx).await?;
    let ctx = copy_proxy_res_headers(ctx).await?;
    let ctx = decorate_user_res(ctx).await?;
    Ok(send_user_res(ctx))
}

fn outbound_mut(ctx: &mut RequestContext) -> Result<&mut OutboundRequest, ProxyError> {
    ctx.outbound
        .as_mut()
        .ok_or_else(|| ProxyError::InvalidRequestOptions("outbound request not built".into()))
}

/// Stage 1.
async fn build_proxy_req(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let inbound = ctx.logical.inbound.clone();
    let options = ctx.logical.options.clone();

    if ctx.decision().is_buffered() {
        let body = match ctx.seed.take() {
            Some(seed) => seed,
            None => {
                let body = materialize(&inbound, options.limit, options.req_as_buffer).await?;
                if let CacheOutcome::Oversized { size } = ctx.logical.cache.offer(&body) {
                    crate::observability::metrics::record_retry_disabled("oversized_body");
                    tracing::debug!(request_id = %inbound.id(), size, "Replay cache disabled");
                }
                body
            }
        };
        ctx.body = Some(body);
    }

    let mut headers = inbound.headers().clone();
    strip_hop_by_hop(&mut headers);
    for (name, value) in options.headers.iter() {
        headers.insert(name.clone(), value.clone());
    }

    ctx.outbound = Some(OutboundRequest {
        method: inbound.method().clone(),
        host: String::new(),
        port: 0,
        secure: false,
        path: inbound.path_and_query(),
        headers,
    });
    tracing::debug!(
        request_id = %inbound.id(),
        method = %inbound.method(),
        replay = ctx.is_replay(),
        buffered = ctx.decision().is_buffered(),
        "Built outbound request"
    );
    Ok(ctx)
}

/// Stage 2.
fn resolve_proxy_host(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let options = ctx.logical.options.clone();
    let resolved = ctx.logical.target.resolve(options.https, options.port);
    let preserve_host = options.preserve_host_header;

    let outbound = outbound_mut(&mut ctx)?;
    if !preserve_host || !outbound.headers.contains_key(header::HOST) {
        let default_port = if resolved.secure { 443 } else { 80 };
        let host_header = if resolved.port == default_port {
            resolved.host.clone()
        } else {
            format!("{}:{}", resolved.host, resolved.port)
        };
        let value = HeaderValue::from_str(&host_header)
            .map_err(|_| ProxyError::InvalidTarget(format!("host `{}`", resolved.host)))?;
        outbound.headers.insert(header::HOST, value);
    }
    outbound.host = resolved.host;
    outbound.port = resolved.port;
    outbound.secure = resolved.secure;
    Ok(ctx)
}

/// Stage 3.
async fn decorate_proxy_req_opts(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let Some(decorator) = ctx.logical.options.proxy_req_opt_decorator.clone() else {
        return Ok(ctx);
    };
    let outbound = ctx
        .outbound
        .take()
        .ok_or_else(|| ProxyError::InvalidRequestOptions("outbound request not built".into()))?;
    let decorated = decorator(outbound, ctx.logical.inbound.clone())
        .resolve()
        .await
        .map_err(|e| ProxyError::hook("proxy_req_opt_decorator", e))?;

    if decorated.host.is_empty() {
        return Err(ProxyError::InvalidRequestOptions("decorated request has no host".into()));
    }
    if decorated.port == 0 {
        return Err(ProxyError::InvalidRequestOptions("decorated request has no port".into()));
    }
    ctx.outbound = Some(decorated);
    Ok(ctx)
}

/// Stage 4.
async fn resolve_proxy_req_path(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let path = match ctx.logical.options.proxy_req_path_resolver.clone() {
        Some(resolver) => resolver(ctx.logical.inbound.clone())
            .resolve()
            .await
            .map_err(|e| ProxyError::hook("proxy_req_path_resolver", e))?,
        None => ctx.logical.inbound.path_and_query(),
    };
    let path = if path.starts_with('/') { path } else { format!("/{path}") };
    outbound_mut(&mut ctx)?.path = path;
    Ok(ctx)
}

/// Stage 5.
async fn decorate_proxy_req_body(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let Some(decorator) = ctx.logical.options.proxy_req_body_decorator.clone() else {
        return Ok(ctx);
    };
    let Some(body) = ctx.body.take() else {
        // Streaming mode: there is nothing in memory to decorate.
        return Ok(ctx);
    };
    let before = body.json_value().cloned();
    let decorated = decorator(body, ctx.logical.inbound.clone())
        .resolve()
        .await
        .map_err(|e| ProxyError::hook("proxy_req_body_decorator", e))?;
    ctx.body = Some(decorated.reconcile(before.as_ref()));
    Ok(ctx)
}

/// Stage 6.
fn prepare_proxy_req(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let encoding = ctx.logical.options.req_body_encoding.clone();
    let prepared = ctx.body.as_ref().filter(|b| b.has_content()).map(|b| b.to_bytes());

    let outbound = outbound_mut(&mut ctx)?;
    match &prepared {
        Some(bytes) => {
            outbound.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            if let Some(value) = encoding.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
                outbound.headers.insert(header::ACCEPT_CHARSET, value);
            }
        }
        None => {
            outbound.headers.remove(header::CONTENT_LENGTH);
        }
    }
    ctx.prepared_body = prepared;
    Ok(ctx)
}

/// Stage 7.
async fn send_proxy_request(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let body = if ctx.decision().is_buffered() {
        DispatchBody::Buffered(ctx.prepared_body.clone())
    } else {
        DispatchBody::Streaming(ctx.logical.inbound.take_body())
    };
    let outbound = ctx
        .outbound
        .as_ref()
        .ok_or_else(|| ProxyError::InvalidRequestOptions("outbound request not built".into()))?;

    let upstream = ctx
        .logical
        .transport
        .dispatch(
            outbound,
            body,
            ctx.logical.options.timeouts(),
            ctx.logical.inbound.abort_signal(),
        )
        .await?;

    tracing::debug!(
        request_id = %ctx.logical.inbound.id(),
        status = upstream.status.as_u16(),
        synthesized = upstream.synthesized,
        bytes = upstream.body.len(),
        "Upstream responded"
    );
    ctx.upstream = Some(upstream);
    Ok(ctx)
}

/// Stage 8.
async fn copy_proxy_res_headers(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let Some(upstream) = ctx.upstream.as_ref() else {
        return Err(ProxyError::InvalidRequestOptions("no upstream response".into()));
    };
    let mut headers = upstream.headers.clone();
    strip_hop_by_hop(&mut headers);
    for name in &ctx.logical.options.stripped_headers {
        headers.remove(name);
    }

    if let Some(decorator) = ctx.logical.options.user_res_headers_decorator.clone() {
        headers = decorator(headers)
            .resolve()
            .await
            .map_err(|e| ProxyError::hook("user_res_headers_decorator", e))?;
    }

    ctx.response = ClientResponse {
        status: upstream.status,
        headers,
        body: upstream.body.clone(),
    };
    Ok(ctx)
}

/// Stage 9.
async fn decorate_user_res(mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
    let Some(decorator) = ctx.logical.options.user_res_decorator.clone() else {
        return Ok(ctx);
    };
    let Some(head) = ctx.upstream.as_ref().map(|u| u.head()) else {
        return Ok(ctx);
    };
    let body = std::mem::take(&mut ctx.response.body);
    ctx.response.body = decorator(head, body, ctx.logical.inbound.clone())
        .resolve()
        .await
        .map_err(|e| ProxyError::hook("user_res_decorator", e))?;
    Ok(ctx)
}

/// Stage 10.
///
/// HEAD and 304 responses keep the upstream's length; 1xx and 204 carry none.
fn send_user_res(mut ctx: RequestContext) -> RequestContext {
    let len = ctx.response.body.len();
    let status = ctx.response.status;
    if status.is_informational() || status == StatusCode::NO_CONTENT {
        ctx.response.headers.remove(header::CONTENT_LENGTH);
    } else if *ctx.logical.inbound.method() != Method::HEAD && status != StatusCode::NOT_MODIFIED {
        ctx.response.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    tracing::debug!(
        request_id = %ctx.logical.inbound.id(),
        status = ctx.response.status.as_u16(),
        bytes = len,
        "Response ready for client"
    );
    ctx
}
