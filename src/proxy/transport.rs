//! Transport dispatcher: one upstream exchange per attempt.
//!
//! # Responsibilities
//! - Open a plain or TLS connection to the resolved host/port
//! - Apply the connect timer, then the overall timer (see `resilience::timeouts`)
//! - Relay the buffered body, or pipe the live inbound stream
//! - Buffer the whole upstream response
//!
//! # Design Decisions
//! - Connection establishment goes through the connector directly, so the
//!   TLS handshake is charged to the connect phase only
//! - Our own timer firing yields a synthesized 504, not an error
//! - Client abort and dropped futures tear down the upstream connection

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use crate::proxy::context::{AbortSignal, OutboundRequest, UpstreamResponse};
use crate::proxy::error::{ConnectErrorKind, ProxyError};
use crate::resilience::timeouts::{Elapsed, TimeoutPlan};

/// Header carried by a synthesized timeout response.
pub const X_TIMEOUT_REASON: &str = "x-timeout-reason";

/// Body relayed for one attempt.
pub enum DispatchBody {
    /// Finalized bytes, or nothing to write.
    Buffered(Option<Bytes>),
    /// The live inbound stream.
    Streaming(Option<Body>),
}

impl DispatchBody {
    fn into_body(self) -> Body {
        match self {
            DispatchBody::Buffered(Some(bytes)) => Body::from(bytes),
            DispatchBody::Streaming(Some(body)) => body,
            DispatchBody::Buffered(None) | DispatchBody::Streaming(None) => Body::empty(),
        }
    }
}

/// Aborts the spawned connection driver when the attempt is dropped.
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Shared upstream connector.
#[derive(Clone)]
pub struct Transport {
    connector: HttpsConnector<HttpConnector>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new() -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|e| ProxyError::Transport(e.to_string()))?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Ok(Self { connector })
    }

    /// Perform one upstream exchange.
    pub async fn dispatch(
        &self,
        outbound: &OutboundRequest,
        body: DispatchBody,
        timeouts: TimeoutPlan,
        abort: &AbortSignal,
    ) -> Result<UpstreamResponse, ProxyError> {
        let scheme = if outbound.secure { "https" } else { "http" };
        let host = if outbound.host.contains(':') {
            format!("[{}]", outbound.host)
        } else {
            outbound.host.clone()
        };
        let authority: Uri = format!("{scheme}://{host}:{}", outbound.port)
            .parse()
            .map_err(|e| ProxyError::InvalidRequestOptions(format!("host `{}`: {e}", outbound.host)))?;

        let mut request = Request::builder()
            .method(outbound.method.clone())
            .uri(outbound.path.as_str())
            .body(body.into_body())
            .map_err(|e| ProxyError::InvalidRequestOptions(format!("path `{}`: {e}", outbound.path)))?;
        *request.headers_mut() = outbound.headers.clone();

        tracing::debug!(
            method = %outbound.method,
            upstream = %authority,
            path = %outbound.path,
            "Dispatching upstream request"
        );

        let attempt = async {
            let started = Instant::now();
            let connecting = self.connector.clone().oneshot(authority.clone());
            let stream = match timeouts.connect(connecting).await {
                Err(elapsed) => return Ok(timeout_response(elapsed)),
                Ok(Err(e)) => return Err(ProxyError::connect(e)),
                Ok(Ok(stream)) => stream,
            };
            let connect_elapsed = started.elapsed();
            tracing::trace!(elapsed = ?connect_elapsed, upstream = %authority, "Upstream connection established");

            match timeouts.exchange(connect_elapsed, exchange(stream, request)).await {
                Err(elapsed) => Ok(timeout_response(elapsed)),
                Ok(result) => result,
            }
        };

        tokio::select! {
            biased;
            _ = abort.aborted() => {
                tracing::debug!(upstream = %authority, "Client aborted; cancelling upstream attempt");
                Err(ProxyError::ClientAborted)
            }
            result = attempt => result,
        }
    }
}

async fn exchange<S>(stream: S, request: Request<Body>) -> Result<UpstreamResponse, ProxyError>
where
    S: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(stream)
        .await
        .map_err(exchange_error)?;
    let _driver = ConnectionTask(tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Upstream connection ended with error");
        }
    }));

    let response = sender.send_request(request).await.map_err(exchange_error)?;
    let (parts, body) = response.into_parts();
    let body = axum::body::to_bytes(Body::new(body), usize::MAX)
        .await
        .map_err(|e| ProxyError::connect(Box::new(e)))?;

    Ok(UpstreamResponse {
        status: parts.status,
        headers: parts.headers,
        body,
        synthesized: false,
    })
}

fn exchange_error(error: hyper::Error) -> ProxyError {
    let kind = ConnectErrorKind::classify(&error);
    if kind != ConnectErrorKind::Other || error.is_incomplete_message() || error.is_canceled() {
        let kind = if kind == ConnectErrorKind::Other { ConnectErrorKind::Reset } else { kind };
        ProxyError::Connect {
            kind,
            source: Box::new(error),
        }
    } else {
        ProxyError::Upstream(Box::new(error))
    }
}

/// Gateway Timeout produced when one of our timers fires.
fn timeout_response(elapsed: Elapsed) -> UpstreamResponse {
    let millis = elapsed.after.as_millis();
    tracing::warn!(
        phase = elapsed.phase.as_str(),
        timeout_ms = millis as u64,
        "Upstream attempt timed out"
    );

    let mut headers = HeaderMap::new();
    let reason = format!("proxy timed out your request after {millis}ms.");
    if let Ok(value) = HeaderValue::from_str(&reason) {
        headers.insert(X_TIMEOUT_REASON, value);
    }
    headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

    UpstreamResponse {
        status: StatusCode::GATEWAY_TIMEOUT,
        headers,
        body: Bytes::new(),
        synthesized: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::timeouts::TimeoutPhase;
    use std::time::Duration;

    #[test]
    fn timeout_response_names_duration() {
        let response = timeout_response(Elapsed {
            phase: TimeoutPhase::Exchange,
            after: Duration::from_millis(150),
        });
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(response.synthesized);
        assert_eq!(
            response.headers[X_TIMEOUT_REASON],
            "proxy timed out your request after 150ms."
        );
        assert_eq!(response.headers["content-type"], "text/plain");
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = Transport::new().unwrap();
        let outbound = OutboundRequest {
            method: axum::http::Method::GET,
            host: "127.0.0.1".into(),
            port,
            secure: false,
            path: "/".into(),
            headers: HeaderMap::new(),
        };
        let err = transport
            .dispatch(&outbound, DispatchBody::Buffered(None), TimeoutPlan::default(), &AbortSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Refused));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unresolvable_host_is_classified() {
        let transport = Transport::new().unwrap();
        let outbound = OutboundRequest {
            method: axum::http::Method::GET,
            host: "upstream.invalid".into(),
            port: 80,
            secure: false,
            path: "/".into(),
            headers: HeaderMap::new(),
        };
        let err = transport
            .dispatch(&outbound, DispatchBody::Buffered(None), TimeoutPlan::default(), &AbortSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Unresolved), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_abort_cancels_attempt() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let (handle, signal) = crate::proxy::context::AbortHandle::new();
        let transport = Transport::new().unwrap();
        let outbound = OutboundRequest {
            method: axum::http::Method::GET,
            host: "127.0.0.1".into(),
            port,
            secure: false,
            path: "/".into(),
            headers: HeaderMap::new(),
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.abort();
        });
        let err = transport
            .dispatch(&outbound, DispatchBody::Buffered(None), TimeoutPlan::default(), &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ClientAborted));
    }
}
