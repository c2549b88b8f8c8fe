//! Structured logging.
//!
//! # Design Decisions
//! - Uses the tracing crate throughout; this module only installs the subscriber
//! - JSON format for production, human format for development
//! - `RUST_LOG` overrides the configured level when set

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_FILTER: &str = "proxy_relay=info,tower_http=info";

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_logging(level: Option<&str>, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => EnvFilter::new(format!("proxy_relay={level},tower_http={level}")),
        None => EnvFilter::new(DEFAULT_FILTER),
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if result.is_ok() {
        tracing::debug!(json, "Logging initialized");
    }
}
