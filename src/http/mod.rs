//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, graceful shutdown)
//!     → request.rs (request ID, trace span)
//!     → proxy::Proxy (current instance from the ArcSwap)
//!     → Send to client
//! ```

pub mod request;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{HttpServer, SharedProxy};
