//! Error taxonomy for the proxy pipeline.
//!
//! # Classes
//! - Connection errors (reset, refused, timed out, unresolved): retryable
//! - Errors carrying a server-class status: retryable
//! - Configuration/programmer errors: fail fast
//!
//! Upstream 5xx *responses* are not errors; the retry engine inspects them
//! on the completed request context instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::proxy::hooks::HookError;

/// Boxed error used for opaque sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Network-level failure class of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    Reset,
    Refused,
    TimedOut,
    Unresolved,
    Tls,
    Other,
}

impl ConnectErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectErrorKind::Reset => "reset",
            ConnectErrorKind::Refused => "refused",
            ConnectErrorKind::TimedOut => "timed_out",
            ConnectErrorKind::Unresolved => "unresolved",
            ConnectErrorKind::Tls => "tls",
            ConnectErrorKind::Other => "other",
        }
    }

    /// Classify an error by walking its source chain.
    ///
    /// I/O error kinds win; DNS and TLS failures are only visible in the
    /// connector's message text.
    pub fn classify(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
        let mut text = String::new();
        while let Some(err) = current {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof => return ConnectErrorKind::Reset,
                    std::io::ErrorKind::ConnectionRefused => return ConnectErrorKind::Refused,
                    std::io::ErrorKind::TimedOut => return ConnectErrorKind::TimedOut,
                    _ => {}
                }
            }
            text.push_str(&err.to_string().to_ascii_lowercase());
            text.push(' ');
            current = err.source();
        }

        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
            || text.contains("nodename nor servname")
        {
            ConnectErrorKind::Unresolved
        } else if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            ConnectErrorKind::Tls
        } else if text.contains("connection reset") || text.contains("broken pipe") {
            ConnectErrorKind::Reset
        } else if text.contains("connection refused") {
            ConnectErrorKind::Refused
        } else {
            ConnectErrorKind::Other
        }
    }
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can abort a proxy attempt or a whole logical request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Connection to the upstream failed or was torn down.
    #[error("upstream connection {kind}: {source}")]
    Connect {
        kind: ConnectErrorKind,
        #[source]
        source: BoxError,
    },

    /// HTTP protocol failure on an established upstream connection.
    #[error("upstream protocol error: {0}")]
    Upstream(#[source] BoxError),

    /// A user hook failed or its future resolved to an error.
    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: &'static str,
        #[source]
        source: HookError,
    },

    /// Reading the inbound body failed.
    #[error("failed to read inbound body: {0}")]
    BodyRead(#[source] BoxError),

    /// Inbound body exceeded the configured buffering limit.
    #[error("inbound body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The proxy target could not be parsed.
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    /// Outbound request options are missing a required field.
    #[error("invalid outbound request options: {0}")]
    InvalidRequestOptions(String),

    /// A replay was requested but no cached body is available.
    #[error("cannot replay request: body too large to cache safely or not yet produced; disable retry for large uploads")]
    ReplayUnavailable,

    /// The inbound exchange was aborted by its originator.
    #[error("inbound request aborted by client")]
    ClientAborted,

    /// Outbound transport could not be initialised.
    #[error("transport initialisation failed: {0}")]
    Transport(String),
}

impl ProxyError {
    /// Build a connection error, classifying it from its source chain.
    pub fn connect(source: BoxError) -> Self {
        let kind = ConnectErrorKind::classify(source.as_ref());
        ProxyError::Connect { kind, source }
    }

    /// Wrap a hook failure with the stage that produced it.
    pub fn hook(stage: &'static str, source: HookError) -> Self {
        ProxyError::Hook { stage, source }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ProxyError::Hook { source, .. } => source.status(),
            ProxyError::BodyTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            _ => None,
        }
    }

    /// Connection error class, if this is a connection error.
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            ProxyError::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the built-in retry policy may retry after this error.
    pub fn is_retryable(&self) -> bool {
        if let Some(kind) = self.connect_kind() {
            return matches!(
                kind,
                ConnectErrorKind::Reset
                    | ConnectErrorKind::Refused
                    | ConnectErrorKind::TimedOut
                    | ConnectErrorKind::Unresolved
            );
        }
        self.status().is_some_and(|s| s.is_server_error())
    }

    /// Status rendered to the client for this error.
    pub fn client_status(&self) -> StatusCode {
        match self {
            ProxyError::Connect { kind: ConnectErrorKind::TimedOut, .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Connect { .. } | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BodyRead(_) | ProxyError::ClientAborted => StatusCode::BAD_REQUEST,
            ProxyError::Hook { source, .. } => source.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.client_status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_classify_directly() {
        let refused: BoxError = Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(ProxyError::connect(refused).connect_kind(), Some(ConnectErrorKind::Refused));

        let reset: BoxError = Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(ProxyError::connect(reset).connect_kind(), Some(ConnectErrorKind::Reset));
    }

    #[test]
    fn dns_failure_classified_from_message() {
        let err: BoxError = "dns error: failed to lookup address information".into();
        assert_eq!(ConnectErrorKind::classify(err.as_ref()), ConnectErrorKind::Unresolved);
    }

    #[test]
    fn retryability_follows_taxonomy() {
        let refused: BoxError = Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(ProxyError::connect(refused).is_retryable());

        let tls: BoxError = "invalid peer certificate".into();
        assert!(!ProxyError::connect(tls).is_retryable());

        let server = HookError::new("boom").with_status(StatusCode::BAD_GATEWAY);
        assert!(ProxyError::hook("response", server).is_retryable());

        let client = HookError::new("nope").with_status(StatusCode::FORBIDDEN);
        assert!(!ProxyError::hook("response", client).is_retryable());

        assert!(!ProxyError::ReplayUnavailable.is_retryable());
        assert!(!ProxyError::BodyTooLarge { limit: 1 }.is_retryable());
    }

    #[test]
    fn renders_status_for_host() {
        let refused: BoxError = Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(ProxyError::connect(refused).into_response().status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::BodyTooLarge { limit: 10 }.into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
