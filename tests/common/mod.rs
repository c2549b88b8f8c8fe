//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use proxy_relay::http::HttpServer;
use proxy_relay::Proxy;

/// What a mock backend answers with.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self::text(status, "")
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// One request as seen by a mock backend.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Handle on a running mock backend.
#[derive(Clone)]
pub struct Backend {
    pub addr: SocketAddr,
    hits: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Backend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

/// Start a backend that always answers 200 with `body`.
pub async fn start_mock_backend(body: &'static str) -> Backend {
    start_programmable_backend(move |_| async move { Reply::text(200, body) }).await
}

/// Start a programmable, recording backend on an ephemeral port.
///
/// `f` receives the zero-based hit number.
pub async fn start_programmable_backend<F, Fut>(f: F) -> Backend
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let backend = Backend {
        addr,
        hits: hits.clone(),
        requests: requests.clone(),
    };

    let app = Router::new().fallback(move |request: Request| {
        let f = f.clone();
        let hits = hits.clone();
        let requests = requests.clone();
        async move {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
            requests.lock().unwrap().push(Recorded {
                method: parts.method.to_string(),
                path: parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_default(),
                headers: parts.headers,
                body,
            });
            let hit = hits.fetch_add(1, Ordering::SeqCst);
            into_response(f(hit).await)
        }
    });

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    backend
}

fn into_response(reply: Reply) -> Response {
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = StatusCode::from_u16(reply.status).unwrap();
    for (name, value) in reply.headers {
        response.headers_mut().insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value).unwrap(),
        );
    }
    response
}

/// Start a backend that accepts connections and never answers.
///
/// The counter tracks accepted connections.
pub async fn start_silent_backend() -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });
    (addr, hits)
}

/// Start a backend that closes every connection without a response.
pub async fn start_resetting_backend() -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = socket.shutdown().await;
        }
    });
    (addr, hits)
}

/// An address nothing listens on.
pub fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Serve `proxy` through the full HTTP stack on an ephemeral port.
pub async fn start_proxy_server(proxy: Proxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(Arc::new(ArcSwap::from_pointee(proxy)));
    tokio::spawn(async move {
        let _ = server.run(listener, std::future::pending()).await;
    });
    addr
}

/// Read a response body to a string.
pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
