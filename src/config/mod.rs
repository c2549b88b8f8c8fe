//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → ProxyOptions::from_config → one Proxy instance
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → new Proxy built and swapped in atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes build a new proxy
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{ListenerConfig, ObservabilityConfig, ProxyConfig, RetrySection, UpstreamConfig};
