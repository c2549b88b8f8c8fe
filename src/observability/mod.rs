//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! proxy, engine, transport, config
//!     → logging.rs (structured log events, request id on every line)
//!     → metrics.rs (counters and histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON or human format)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
