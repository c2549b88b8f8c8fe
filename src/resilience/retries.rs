//! Retry configuration and classification.
//!
//! # Responsibilities
//! - Resolve the user's retry setting into one immutable [`RetryConfig`]
//! - Classify errors and completed responses as retryable or final
//!
//! # Design Decisions
//! - Connection-level failures and server-class statuses are retryable
//! - Client-class statuses are never retried
//! - A custom strategy replaces the built-in policy entirely

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;

use crate::proxy::error::ProxyError;
use crate::proxy::replay::RetryStrategy;

/// Default attempt budget when retry is switched on.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default lower bound on backoff delay.
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Numeric retry knobs as supplied by the user. Unset fields take defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryOptions {
    pub retries: Option<u32>,
    pub max_retry_time: Option<Duration>,
    pub min_timeout: Option<Duration>,
    pub max_timeout: Option<Duration>,
}

/// Resolved retry configuration, one per proxy instance.
#[derive(Clone)]
pub struct RetryConfig {
    /// Whether any retry handling applies.
    pub enabled: bool,
    /// Additional attempts allowed after the first.
    pub retries: u32,
    /// Wall-clock budget for the whole logical request. `None` is unbounded.
    pub max_retry_time: Option<Duration>,
    /// Backoff base.
    pub min_timeout: Duration,
    /// Backoff ceiling. `None` is unbounded.
    pub max_timeout: Option<Duration>,
    /// User strategy; excludes the built-in policy when present.
    pub custom_handler: Option<Arc<dyn RetryStrategy>>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("enabled", &self.enabled)
            .field("retries", &self.retries)
            .field("max_retry_time", &self.max_retry_time)
            .field("min_timeout", &self.min_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("custom_handler", &self.custom_handler.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryConfig {
    /// Retry off: exactly one attempt.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            retries: 0,
            max_retry_time: None,
            min_timeout: DEFAULT_MIN_TIMEOUT,
            max_timeout: None,
            custom_handler: None,
        }
    }

    /// Built-in policy with default knobs (`retry: true`).
    pub fn standard() -> Self {
        Self {
            enabled: true,
            retries: DEFAULT_RETRIES,
            ..Self::disabled()
        }
    }

    /// Built-in policy with user knobs.
    pub fn from_options(options: RetryOptions) -> Self {
        Self {
            enabled: true,
            retries: options.retries.unwrap_or(DEFAULT_RETRIES),
            max_retry_time: options.max_retry_time,
            min_timeout: options.min_timeout.unwrap_or(DEFAULT_MIN_TIMEOUT),
            max_timeout: options.max_timeout,
            custom_handler: None,
        }
    }

    /// User-owned strategy.
    pub fn custom(strategy: impl RetryStrategy + 'static) -> Self {
        Self {
            enabled: true,
            custom_handler: Some(Arc::new(strategy)),
            ..Self::disabled()
        }
    }

    pub fn is_custom(&self) -> bool {
        self.custom_handler.is_some()
    }

    /// Total attempts the built-in policy may make.
    pub fn max_attempts(&self) -> u32 {
        if self.enabled {
            self.retries.saturating_add(1)
        } else {
            1
        }
    }
}

/// Whether an attempt error may be retried by the built-in policy.
pub fn should_retry_error(error: &ProxyError) -> bool {
    error.is_retryable()
}

/// Whether a completed response may be retried by the built-in policy.
pub fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
}
