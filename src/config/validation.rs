//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the upstream target parses
//! - Validate value ranges (timeouts > 0, body limit > 0)
//! - Check header names and values are legal
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::proxy::target::ProxyTarget;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("upstream.target must not be empty")]
    MissingTarget,

    #[error("upstream.target is invalid: {0}")]
    InvalidTarget(String),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    #[error("listener.bind_address `{0}` is not a socket address")]
    InvalidBindAddress(String),
}

/// Check the whole configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let upstream = &config.upstream;

    if upstream.target.trim().is_empty() {
        errors.push(ValidationError::MissingTarget);
    } else if let Err(e) = ProxyTarget::parse(&upstream.target) {
        errors.push(ValidationError::InvalidTarget(e.to_string()));
    }

    if upstream.connect_timeout_ms == Some(0) {
        errors.push(ValidationError::ZeroValue("upstream.connect_timeout_ms"));
    }
    if upstream.timeout_ms == Some(0) {
        errors.push(ValidationError::ZeroValue("upstream.timeout_ms"));
    }
    if upstream.body_limit_bytes == 0 {
        errors.push(ValidationError::ZeroValue("upstream.body_limit_bytes"));
    }
    if upstream.port == Some(0) {
        errors.push(ValidationError::ZeroValue("upstream.port"));
    }

    for (name, value) in &upstream.headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
            errors.push(ValidationError::InvalidHeader(name.clone()));
        }
    }
    for name in &upstream.stripped_headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidHeader(name.clone()));
        }
    }

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(config.listener.bind_address.clone()));
    }

    if let (Some(connect), Some(overall)) = (upstream.connect_timeout_ms, upstream.timeout_ms) {
        if connect > overall {
            tracing::warn!(
                connect_timeout_ms = connect,
                timeout_ms = overall,
                "Connect timeout exceeds overall timeout; the overall timer starts after connect"
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.upstream.target = "http://127.0.0.1:3000".into();
        config
    }

    #[test]
    fn accepts_minimal_config() {
        assert_eq!(validate_config(&valid()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = valid();
        config.upstream.target = String::new();
        config.upstream.timeout_ms = Some(0);
        config.upstream.headers.insert("bad header".into(), "v".into());

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::MissingTarget));
        assert!(errors.contains(&ValidationError::ZeroValue("upstream.timeout_ms")));
        assert!(errors.contains(&ValidationError::InvalidHeader("bad header".into())));
    }

    #[test]
    fn rejects_unparsable_target() {
        let mut config = valid();
        config.upstream.target = "ftp://files.example.com".into();
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidTarget(_)));
    }
}
