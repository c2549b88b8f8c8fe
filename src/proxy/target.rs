//! Upstream target description, fixed when the proxy is constructed.

use url::Url;

use crate::proxy::error::ProxyError;

/// Parsed upstream host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    host: String,
    port: Option<u16>,
    secure: bool,
}

impl ProxyTarget {
    /// Parse `host`, `host:port` or `http(s)://host[:port]`.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProxyError::InvalidTarget("host should not be empty".into()));
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };
        let url = Url::parse(&with_scheme).map_err(|e| ProxyError::InvalidTarget(format!("{raw}: {e}")))?;

        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::InvalidTarget(format!("unsupported scheme `{other}`")));
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidTarget(format!("{raw}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: url.port(),
            secure,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port given explicitly in the target, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether the target names the secure transport itself.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Resolve transport and port against the `https`/`port` overrides.
    pub fn resolve(&self, https: Option<bool>, port: Option<u16>) -> ResolvedHost {
        let secure = https.unwrap_or(false) || self.secure;
        let port = port
            .or(self.port)
            .unwrap_or(if secure { 443 } else { 80 });
        ResolvedHost {
            host: self.host.clone(),
            port,
            secure,
        }
    }
}

/// Host, port and transport selected for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}
