//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::body::DEFAULT_BODY_LIMIT;
use crate::proxy::options::DEFAULT_REQ_BODY_ENCODING;
use crate::resilience::retries::{RetryConfig, RetryOptions};

/// Root configuration for the proxy binary.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Upstream target and request shaping.
    pub upstream: UpstreamConfig,

    /// Retry policy.
    pub retry: RetrySection,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream target and request shaping knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream host: `host`, `host:port` or `http(s)://host[:port]`.
    pub target: String,

    /// Force the secure transport.
    pub https: Option<bool>,

    /// Override the upstream port.
    pub port: Option<u16>,

    /// Connect-phase timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,

    /// Per-attempt timeout in milliseconds, counted after connect when a
    /// connect timeout is also set.
    pub timeout_ms: Option<u64>,

    /// Extra headers added to every outbound request.
    pub headers: BTreeMap<String, String>,

    /// Upstream response headers never relayed to the client.
    pub stripped_headers: Vec<String>,

    /// Keep the client's Host header instead of the upstream authority.
    pub preserve_host_header: bool,

    /// Buffer inbound bodies (enables retry) instead of streaming them.
    pub parse_req_body: bool,

    /// Encoding advertised for textual bodies; empty string sends none.
    pub req_body_encoding: Option<String>,

    /// Keep buffered bodies as raw bytes instead of decoding them.
    pub req_as_buffer: bool,

    /// Maximum buffered inbound body size in bytes.
    pub body_limit_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            https: None,
            port: None,
            connect_timeout_ms: None,
            timeout_ms: None,
            headers: BTreeMap::new(),
            stripped_headers: Vec::new(),
            preserve_host_header: false,
            parse_req_body: true,
            req_body_encoding: Some(DEFAULT_REQ_BODY_ENCODING.to_string()),
            req_as_buffer: false,
            body_limit_bytes: DEFAULT_BODY_LIMIT,
        }
    }
}

/// `retry = false`, `retry = true`, or a `[retry]` table.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum RetrySection {
    Toggle(bool),
    Options(RetryKnobs),
}

impl Default for RetrySection {
    fn default() -> Self {
        RetrySection::Toggle(false)
    }
}

/// Numeric retry knobs. Negative values clamp to zero.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryKnobs {
    pub retries: Option<i64>,
    pub max_retry_time_ms: Option<i64>,
    pub min_timeout_ms: Option<i64>,
    pub max_timeout_ms: Option<i64>,
}

fn clamp_ms(value: Option<i64>) -> Option<Duration> {
    value.map(|ms| Duration::from_millis(ms.max(0) as u64))
}

impl RetrySection {
    /// Resolve into the runtime retry configuration.
    pub fn resolve(&self) -> RetryConfig {
        match self {
            RetrySection::Toggle(false) => RetryConfig::disabled(),
            RetrySection::Toggle(true) => RetryConfig::standard(),
            RetrySection::Options(knobs) => RetryConfig::from_options(RetryOptions {
                retries: knobs.retries.map(|r| r.clamp(0, u32::MAX as i64) as u32),
                max_retry_time: clamp_ms(knobs.max_retry_time_ms),
                min_timeout: clamp_ms(knobs.min_timeout_ms),
                max_timeout: clamp_ms(knobs.max_timeout_ms),
            }),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
