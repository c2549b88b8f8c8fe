//! Retrying reverse-proxy library.
//!
//! The core is [`proxy::Proxy`]: a fixed upstream, immutable options, and a
//! retry engine that replays buffered bodies safely. Everything else here
//! (config, HTTP server, observability, lifecycle) is the ambient stack the
//! `proxy-relay` binary runs it with.

// Core
pub mod proxy;
pub mod resilience;

// Host integration
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::{proxy_handler, proxy_middleware, Proxy, ProxyError, ProxyOptions, ProxyOutcome};
