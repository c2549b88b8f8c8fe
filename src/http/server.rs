//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router that hands every request to the proxy
//! - Wire up middleware (tracing, request ID)
//! - Serve plain or TLS listeners with graceful shutdown
//!
//! # Design Decisions
//! - The proxy lives behind an `ArcSwap` so config reloads replace it
//!   without touching in-flight requests
//! - No server-wide request timeout: per-attempt timers belong to the
//!   proxy and retries may legitimately outlast any single attempt

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::http::request::{propagate_request_id_layer, request_span, set_request_id_layer};
use crate::proxy::{Proxy, ProxyOutcome};

/// Proxy handle shared with handlers, swapped on config reload.
pub type SharedProxy = Arc<ArcSwap<Proxy>>;

/// Grace period for in-flight requests once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(proxy: SharedProxy) -> Self {
        Self {
            router: Self::build_router(proxy),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(proxy: SharedProxy) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(proxy)
            .layer(
                ServiceBuilder::new()
                    .layer(set_request_id_layer())
                    .layer(TraceLayer::new_for_http().make_span_with(request_span))
                    .layer(propagate_request_id_layer()),
            )
    }

    /// The configured router, e.g. for in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve plain HTTP until `shutdown` resolves.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS until `shutdown` resolves.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let handle = axum_server::Handle::new();
        let trigger = handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            trigger.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        tracing::info!(address = %addr, "HTTPS server starting");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

/// Fallback handler: every request goes to the current proxy.
async fn forward(State(proxy): State<SharedProxy>, request: Request) -> Response {
    let proxy = proxy.load_full();
    match proxy.handle(request).await {
        Ok(ProxyOutcome::Proxied(response)) => response,
        Ok(ProxyOutcome::Skipped(_)) => (StatusCode::NOT_FOUND, "Not proxied").into_response(),
        Err(error) => error.into_response(),
    }
}
