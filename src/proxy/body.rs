//! Body materialization and replay caching.
//!
//! # Responsibilities
//! - Decide buffered vs. streaming mode once per logical request
//! - Read and decode the inbound body in buffered mode
//! - Hold the replayable body for retries, guarded by a size ceiling
//!
//! # Design Decisions
//! - The decision is a value threaded alongside the options, never written
//!   back into them
//! - Streaming mode leaves the inbound stream untouched until dispatch
//! - Bodies above [`MAX_CACHEABLE_BODY_SIZE`] are never cached

use std::sync::{Mutex, PoisonError};

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;

use crate::proxy::context::InboundRequest;
use crate::proxy::error::ProxyError;
use crate::proxy::hooks::BodyPredicate;

/// Largest body kept in memory for replay.
pub const MAX_CACHEABLE_BODY_SIZE: usize = 20 * 1024 * 1024;

/// Default buffering limit for inbound bodies.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Source of the buffered/streaming decision.
#[derive(Clone)]
pub enum BodyMode {
    Fixed(bool),
    Predicate(BodyPredicate),
}

impl Default for BodyMode {
    fn default() -> Self {
        BodyMode::Fixed(true)
    }
}

impl std::fmt::Debug for BodyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyMode::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            BodyMode::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl BodyMode {
    /// Evaluate against the inbound request. Called once per logical request.
    pub fn resolve(&self, inbound: &InboundRequest) -> BodyDecision {
        let buffered = match self {
            BodyMode::Fixed(value) => *value,
            BodyMode::Predicate(predicate) => predicate(inbound),
        };
        if buffered {
            BodyDecision::Buffered
        } else {
            BodyDecision::Streaming
        }
    }
}

/// Resolved body handling for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDecision {
    Buffered,
    Streaming,
}

impl BodyDecision {
    pub fn is_buffered(&self) -> bool {
        matches!(self, BodyDecision::Buffered)
    }
}

/// Decoded inbound body.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializedBody {
    Empty,
    Bytes(Bytes),
    Text(String),
    /// Parsed JSON. `raw` holds the client's bytes while `value` still
    /// matches them, and is what goes on the wire.
    Json {
        value: serde_json::Value,
        raw: Option<Bytes>,
    },
}

impl MaterializedBody {
    /// JSON body with no client bytes attached; serialized when sent.
    pub fn json(value: serde_json::Value) -> Self {
        MaterializedBody::Json { value, raw: None }
    }

    /// The parsed value, for JSON bodies.
    pub fn json_value(&self) -> Option<&serde_json::Value> {
        match self {
            MaterializedBody::Json { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Drop the client's bytes if a decorator changed the parsed value.
    ///
    /// `before` is the value the decorator was given.
    pub(crate) fn reconcile(self, before: Option<&serde_json::Value>) -> Self {
        match self {
            MaterializedBody::Json { value, raw: Some(raw) } if before == Some(&value) => {
                MaterializedBody::Json { value, raw: Some(raw) }
            }
            MaterializedBody::Json { value, .. } => MaterializedBody::json(value),
            other => other,
        }
    }

    /// Decode raw bytes according to the request's content type.
    pub fn decode(raw: Bytes, headers: &HeaderMap, as_buffer: bool) -> Self {
        if raw.is_empty() {
            return MaterializedBody::Empty;
        }
        if as_buffer {
            return MaterializedBody::Bytes(raw);
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();

        if content_type == "application/json" || content_type.ends_with("+json") {
            return match serde_json::from_slice(&raw) {
                Ok(value) => MaterializedBody::Json { value, raw: Some(raw) },
                Err(_) => MaterializedBody::Bytes(raw),
            };
        }

        if content_type.starts_with("text/") || content_type == "application/x-www-form-urlencoded" {
            return match String::from_utf8(raw.to_vec()) {
                Ok(text) => MaterializedBody::Text(text),
                Err(_) => MaterializedBody::Bytes(raw),
            };
        }

        MaterializedBody::Bytes(raw)
    }

    /// Size in bytes as it would be sent.
    pub fn size(&self) -> usize {
        match self {
            MaterializedBody::Empty => 0,
            MaterializedBody::Bytes(bytes) => bytes.len(),
            MaterializedBody::Text(text) => text.len(),
            MaterializedBody::Json { raw: Some(raw), .. } => raw.len(),
            MaterializedBody::Json { value, raw: None } => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
        }
    }

    /// Whether there is anything worth sending.
    pub fn has_content(&self) -> bool {
        match self {
            MaterializedBody::Empty => false,
            MaterializedBody::Bytes(bytes) => !bytes.is_empty(),
            MaterializedBody::Text(text) => !text.is_empty(),
            MaterializedBody::Json { value, .. } => match value {
                serde_json::Value::Null => false,
                serde_json::Value::Object(map) => !map.is_empty(),
                serde_json::Value::Array(items) => !items.is_empty(),
                _ => true,
            },
        }
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            MaterializedBody::Empty => Bytes::new(),
            MaterializedBody::Bytes(bytes) => bytes.clone(),
            MaterializedBody::Text(text) => Bytes::from(text.clone()),
            MaterializedBody::Json { raw: Some(raw), .. } => raw.clone(),
            MaterializedBody::Json { value, raw: None } => {
                serde_json::to_vec(value).map(Bytes::from).unwrap_or_default()
            }
        }
    }
}

/// Read the whole inbound body and decode it.
///
/// A body already taken by an earlier attempt reads as empty.
pub async fn materialize(
    inbound: &InboundRequest,
    limit: usize,
    as_buffer: bool,
) -> Result<MaterializedBody, ProxyError> {
    let Some(body) = inbound.take_body() else {
        return Ok(MaterializedBody::Empty);
    };
    let raw = read_limited(body, limit).await?;
    Ok(MaterializedBody::decode(raw, inbound.headers(), as_buffer))
}

async fn read_limited(body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let too_large = std::error::Error::source(&e)
            .map(|s| s.to_string().contains("length limit exceeded"))
            .unwrap_or(false)
            || e.to_string().contains("length limit exceeded");
        if too_large {
            ProxyError::BodyTooLarge { limit }
        } else {
            ProxyError::BodyRead(Box::new(e))
        }
    })
}

/// Outcome of offering a body to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Cached,
    AlreadyCached,
    Oversized { size: usize },
    Disabled,
}

#[derive(Debug, Default)]
struct CacheState {
    body: Option<MaterializedBody>,
    disabled: bool,
}

/// Replay cache scoped to one logical request.
#[derive(Debug, Default)]
pub struct BodyCache {
    state: Mutex<CacheState>,
}

impl BodyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first materialized body of the logical request.
    pub fn offer(&self, body: &MaterializedBody) -> CacheOutcome {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.disabled {
            return CacheOutcome::Disabled;
        }
        if state.body.is_some() {
            return CacheOutcome::AlreadyCached;
        }

        let size = body.size();
        if size > MAX_CACHEABLE_BODY_SIZE {
            state.disabled = true;
            tracing::warn!(
                size_mb = size / 1024 / 1024,
                limit_mb = MAX_CACHEABLE_BODY_SIZE / 1024 / 1024,
                "Body size exceeds cache limit, retries disabled for this request"
            );
            return CacheOutcome::Oversized { size };
        }

        state.body = Some(body.clone());
        CacheOutcome::Cached
    }

    /// False once an oversized body has been seen.
    pub fn is_cachable(&self) -> bool {
        !self.state.lock().unwrap_or_else(PoisonError::into_inner).disabled
    }

    /// Cached body for a replay, if one is available.
    pub fn replay_body(&self) -> Option<MaterializedBody> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.disabled {
            None
        } else {
            state.body.clone()
        }
    }
}
