//! User customisation hooks.
//!
//! Every hook may answer synchronously or asynchronously. Both shapes are
//! carried by [`HookOutput`], which the pipeline awaits uniformly, so a hook
//! that fails immediately and one whose future resolves to an error abort
//! the attempt the same way.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use futures_util::future::BoxFuture;

use crate::proxy::body::MaterializedBody;
use crate::proxy::context::{InboundRequest, OutboundRequest, ResponseHead};
use crate::proxy::error::BoxError;

/// Failure raised by a user hook.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
    status: Option<StatusCode>,
    #[source]
    source: Option<BoxError>,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Attach an HTTP status. Server-class statuses make the failure retryable.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

/// Result of a hook: either already available or still pending.
pub enum HookOutput<T, E = HookError> {
    Ready(Result<T, E>),
    Pending(BoxFuture<'static, Result<T, E>>),
}

impl<T, E> HookOutput<T, E> {
    /// Successful synchronous result.
    pub fn ready(value: T) -> Self {
        HookOutput::Ready(Ok(value))
    }

    /// Failed synchronous result.
    pub fn fail(error: E) -> Self {
        HookOutput::Ready(Err(error))
    }

    /// Asynchronous result.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        HookOutput::Pending(Box::pin(future))
    }

    /// Await the result regardless of which shape it was produced in.
    pub async fn resolve(self) -> Result<T, E> {
        match self {
            HookOutput::Ready(result) => result,
            HookOutput::Pending(future) => future.await,
        }
    }
}

impl<T, E> From<Result<T, E>> for HookOutput<T, E> {
    fn from(result: Result<T, E>) -> Self {
        HookOutput::Ready(result)
    }
}

/// Decides whether a request is proxied at all.
pub type Filter = Arc<dyn Fn(&InboundRequest) -> bool + Send + Sync>;

/// Per-request buffering predicate.
pub type BodyPredicate = Arc<dyn Fn(&InboundRequest) -> bool + Send + Sync>;

/// Computes the outbound path (including query).
pub type PathResolver = Arc<dyn Fn(Arc<InboundRequest>) -> HookOutput<String> + Send + Sync>;

/// Rewrites the outbound request descriptor.
pub type ReqOptDecorator =
    Arc<dyn Fn(OutboundRequest, Arc<InboundRequest>) -> HookOutput<OutboundRequest> + Send + Sync>;

/// Rewrites the buffered outbound body.
pub type ReqBodyDecorator =
    Arc<dyn Fn(MaterializedBody, Arc<InboundRequest>) -> HookOutput<MaterializedBody> + Send + Sync>;

/// Rewrites the upstream response body before relay.
pub type ResDecorator =
    Arc<dyn Fn(ResponseHead, Bytes, Arc<InboundRequest>) -> HookOutput<Bytes> + Send + Sync>;

/// Rewrites the headers relayed to the client.
pub type ResHeadersDecorator = Arc<dyn Fn(HeaderMap) -> HookOutput<HeaderMap> + Send + Sync>;
