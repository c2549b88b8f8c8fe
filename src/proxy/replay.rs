//! User-owned retry strategies and the replay handle they drive.
//!
//! A strategy receives a [`ReplayHandle`] and decides on its own how many
//! attempts to make, how long to wait between them, and which outcome
//! counts as success. The handle guarantees each call gets a container it
//! can safely run:
//!
//! ```text
//! call 1    original container, reads the live inbound body
//! call 2..  fresh container seeded from the cached body
//!           or ReplayUnavailable when nothing safe is cached
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::proxy::context::{InboundRequest, LogicalRequest, RequestContext};
use crate::proxy::error::ProxyError;
use crate::proxy::hooks::HookOutput;
use crate::proxy::pipeline;

/// Custom retry policy.
///
/// Implemented for every matching closure, so most callers pass one:
///
/// ```ignore
/// options.retry_strategy(|handle: ReplayHandle, _req| {
///     HookOutput::future(async move {
///         match handle.execute().await {
///             Ok(ctx) if ctx.status().is_server_error() => handle.execute().await,
///             other => other,
///         }
///     })
/// })
/// ```
pub trait RetryStrategy: Send + Sync {
    fn retry(
        &self,
        handle: ReplayHandle,
        inbound: Arc<InboundRequest>,
    ) -> HookOutput<RequestContext, ProxyError>;
}

impl<F> RetryStrategy for F
where
    F: Fn(ReplayHandle, Arc<InboundRequest>) -> HookOutput<RequestContext, ProxyError> + Send + Sync,
{
    fn retry(
        &self,
        handle: ReplayHandle,
        inbound: Arc<InboundRequest>,
    ) -> HookOutput<RequestContext, ProxyError> {
        self(handle, inbound)
    }
}

struct ReplayState {
    logical: LogicalRequest,
    original: Mutex<Option<RequestContext>>,
    attempts: AtomicU32,
}

/// Executes one pipeline attempt per call. Cheap to clone.
#[derive(Clone)]
pub struct ReplayHandle {
    state: Arc<ReplayState>,
}

impl std::fmt::Debug for ReplayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayHandle")
            .field("request_id", &self.state.logical.inbound.id())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl ReplayHandle {
    pub(crate) fn new(logical: LogicalRequest) -> Self {
        let original = logical.first_attempt();
        Self {
            state: Arc::new(ReplayState {
                logical,
                original: Mutex::new(Some(original)),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Run one attempt.
    ///
    /// Fails with [`ProxyError::ReplayUnavailable`] when this is not the
    /// first call and no body could be cached (oversized, or never read).
    pub async fn execute(&self) -> Result<RequestContext, ProxyError> {
        let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let original = self
            .state
            .original
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let ctx = match original {
            Some(ctx) => ctx,
            None => match self.state.logical.cache.replay_body() {
                Some(body) => self.state.logical.replay(body),
                None => {
                    tracing::warn!(
                        request_id = %self.state.logical.inbound.id(),
                        attempt,
                        "Replay refused: no cached body available"
                    );
                    return Err(ProxyError::ReplayUnavailable);
                }
            },
        };

        tracing::debug!(
            request_id = %self.state.logical.inbound.id(),
            attempt,
            replay = ctx.is_replay(),
            "Custom strategy attempt"
        );
        crate::observability::metrics::record_attempt(if attempt == 0 { "initial" } else { "replay" });
        pipeline::execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};

    use crate::proxy::body::MaterializedBody;
    use crate::proxy::options::ProxyOptions;
    use crate::proxy::target::ProxyTarget;
    use crate::proxy::transport::Transport;

    fn logical(body: &'static str) -> LogicalRequest {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header("content-type", "text/plain")
            .body(Body::from(body))
            .unwrap();
        // Port 9 (discard) on localhost is refused on test hosts; only the
        // container bookkeeping matters here.
        LogicalRequest::new(
            Arc::new(InboundRequest::new(request)),
            Arc::new(ProxyTarget::parse("http://127.0.0.1:9").unwrap()),
            Arc::new(ProxyOptions::default()),
            Transport::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn second_call_replays_cached_body() {
        let handle = ReplayHandle::new(logical("payload"));
        let _ = handle.execute().await;
        assert_eq!(
            handle.state.logical.cache.replay_body(),
            Some(MaterializedBody::Text("payload".into()))
        );
        let _ = handle.execute().await;
        assert_eq!(handle.attempts(), 2);
    }

    #[tokio::test]
    async fn replay_refused_when_cache_disabled() {
        let logical = logical("payload");
        let oversized = MaterializedBody::Bytes(vec![0u8; crate::proxy::body::MAX_CACHEABLE_BODY_SIZE + 1].into());
        logical.cache.offer(&oversized);

        let handle = ReplayHandle::new(logical);
        // Drop the original container without running it.
        handle.state.original.lock().unwrap().take();
        let err = handle.execute().await.unwrap_err();
        assert!(matches!(err, ProxyError::ReplayUnavailable));
    }

    #[tokio::test]
    async fn closures_are_strategies() {
        let strategy = |handle: ReplayHandle, _inbound: Arc<InboundRequest>| {
            HookOutput::future(async move { handle.execute().await })
        };
        let logical = logical("x");
        let inbound = logical.inbound.clone();
        let result = strategy
            .retry(ReplayHandle::new(logical), inbound)
            .resolve()
            .await;
        assert!(result.is_err());
    }
}
