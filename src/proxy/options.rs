//! Resolved, immutable proxy options.
//!
//! Built once per proxy instance, either through the chained setters below
//! or from the `[upstream]` and `[retry]` config sections, then shared by
//! `Arc` across every attempt of every logical request.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::schema::{RetrySection, UpstreamConfig};
use crate::config::validation::ValidationError;
use crate::proxy::body::{BodyMode, MaterializedBody, DEFAULT_BODY_LIMIT};
use crate::proxy::context::{InboundRequest, OutboundRequest, RequestContext, ResponseHead};
use crate::proxy::error::ProxyError;
use crate::proxy::hooks::{
    Filter, HookOutput, PathResolver, ReqBodyDecorator, ReqOptDecorator, ResDecorator,
    ResHeadersDecorator,
};
use crate::proxy::replay::ReplayHandle;
use crate::resilience::retries::{RetryConfig, RetryOptions};
use crate::resilience::timeouts::TimeoutPlan;

/// Character encoding advertised for textual bodies unless overridden.
pub const DEFAULT_REQ_BODY_ENCODING: &str = "utf-8";

#[derive(Clone)]
pub struct ProxyOptions {
    pub filter: Option<Filter>,
    pub parse_req_body: BodyMode,
    /// `None` sends no encoding header.
    pub req_body_encoding: Option<String>,
    pub req_as_buffer: bool,
    pub limit: usize,
    pub headers: HeaderMap,
    pub stripped_headers: Vec<HeaderName>,
    pub preserve_host_header: bool,
    pub https: Option<bool>,
    pub port: Option<u16>,
    pub connect_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub proxy_req_path_resolver: Option<PathResolver>,
    pub proxy_req_opt_decorator: Option<ReqOptDecorator>,
    pub proxy_req_body_decorator: Option<ReqBodyDecorator>,
    pub user_res_decorator: Option<ResDecorator>,
    pub user_res_headers_decorator: Option<ResHeadersDecorator>,
    pub retry: RetryConfig,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            filter: None,
            parse_req_body: BodyMode::default(),
            req_body_encoding: Some(DEFAULT_REQ_BODY_ENCODING.to_string()),
            req_as_buffer: false,
            limit: DEFAULT_BODY_LIMIT,
            headers: HeaderMap::new(),
            stripped_headers: Vec::new(),
            preserve_host_header: false,
            https: None,
            port: None,
            connect_timeout: None,
            timeout: None,
            proxy_req_path_resolver: None,
            proxy_req_opt_decorator: None,
            proxy_req_body_decorator: None,
            user_res_decorator: None,
            user_res_headers_decorator: None,
            retry: RetryConfig::disabled(),
        }
    }
}

impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("parse_req_body", &self.parse_req_body)
            .field("req_body_encoding", &self.req_body_encoding)
            .field("req_as_buffer", &self.req_as_buffer)
            .field("limit", &self.limit)
            .field("headers", &self.headers)
            .field("stripped_headers", &self.stripped_headers)
            .field("preserve_host_header", &self.preserve_host_header)
            .field("https", &self.https)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the config file sections. Hooks stay unset.
    pub fn from_config(upstream: &UpstreamConfig, retry: &RetrySection) -> Result<Self, ValidationError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &upstream.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value).map_err(|_| ValidationError::InvalidHeader(name.to_string()))?;
            headers.insert(name, value);
        }
        let stripped_headers = upstream
            .stripped_headers
            .iter()
            .map(|name| HeaderName::from_bytes(name.as_bytes()).map_err(|_| ValidationError::InvalidHeader(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            parse_req_body: BodyMode::Fixed(upstream.parse_req_body),
            req_body_encoding: upstream.req_body_encoding.clone().filter(|e| !e.is_empty()),
            req_as_buffer: upstream.req_as_buffer,
            limit: upstream.body_limit_bytes,
            headers,
            stripped_headers,
            preserve_host_header: upstream.preserve_host_header,
            https: upstream.https,
            port: upstream.port,
            connect_timeout: upstream.connect_timeout_ms.map(Duration::from_millis),
            timeout: upstream.timeout_ms.map(Duration::from_millis),
            retry: retry.resolve(),
            ..Self::default()
        })
    }

    pub fn timeouts(&self) -> TimeoutPlan {
        TimeoutPlan::new(self.connect_timeout, self.timeout)
    }

    /// Whether the request should be proxied. Defaults to always.
    pub fn accepts(&self, inbound: &InboundRequest) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(inbound))
    }

    pub fn filter(mut self, filter: impl Fn(&InboundRequest) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Buffer (`true`) or stream (`false`) every inbound body.
    pub fn parse_req_body(mut self, buffered: bool) -> Self {
        self.parse_req_body = BodyMode::Fixed(buffered);
        self
    }

    /// Decide buffering per request.
    pub fn parse_req_body_with(
        mut self,
        predicate: impl Fn(&InboundRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.parse_req_body = BodyMode::Predicate(Arc::new(predicate));
        self
    }

    pub fn req_body_encoding(mut self, encoding: Option<&str>) -> Self {
        self.req_body_encoding = encoding.map(str::to_string);
        self
    }

    pub fn req_as_buffer(mut self, as_buffer: bool) -> Self {
        self.req_as_buffer = as_buffer;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn strip_header(mut self, name: HeaderName) -> Self {
        self.stripped_headers.push(name);
        self
    }

    pub fn preserve_host_header(mut self, preserve: bool) -> Self {
        self.preserve_host_header = preserve;
        self
    }

    pub fn https(mut self, https: bool) -> Self {
        self.https = Some(https);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy_req_path_resolver(
        mut self,
        resolver: impl Fn(Arc<InboundRequest>) -> HookOutput<String> + Send + Sync + 'static,
    ) -> Self {
        self.proxy_req_path_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn proxy_req_opt_decorator(
        mut self,
        decorator: impl Fn(OutboundRequest, Arc<InboundRequest>) -> HookOutput<OutboundRequest> + Send + Sync + 'static,
    ) -> Self {
        self.proxy_req_opt_decorator = Some(Arc::new(decorator));
        self
    }

    pub fn proxy_req_body_decorator(
        mut self,
        decorator: impl Fn(MaterializedBody, Arc<InboundRequest>) -> HookOutput<MaterializedBody> + Send + Sync + 'static,
    ) -> Self {
        self.proxy_req_body_decorator = Some(Arc::new(decorator));
        self
    }

    pub fn user_res_decorator(
        mut self,
        decorator: impl Fn(ResponseHead, Bytes, Arc<InboundRequest>) -> HookOutput<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.user_res_decorator = Some(Arc::new(decorator));
        self
    }

    pub fn user_res_headers_decorator(
        mut self,
        decorator: impl Fn(HeaderMap) -> HookOutput<HeaderMap> + Send + Sync + 'static,
    ) -> Self {
        self.user_res_headers_decorator = Some(Arc::new(decorator));
        self
    }

    /// Built-in policy with default knobs.
    pub fn retry(mut self) -> Self {
        self.retry = RetryConfig::standard();
        self
    }

    /// Built-in policy with custom knobs.
    pub fn retry_with(mut self, options: RetryOptions) -> Self {
        self.retry = RetryConfig::from_options(options);
        self
    }

    /// User-owned policy driving a [`ReplayHandle`]. Named
    /// [`RetryStrategy`](crate::proxy::replay::RetryStrategy) types go through
    /// [`ProxyOptions::retry_config`] and [`RetryConfig::custom`].
    pub fn retry_strategy(
        mut self,
        strategy: impl Fn(ReplayHandle, Arc<InboundRequest>) -> HookOutput<RequestContext, ProxyError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.retry = RetryConfig::custom(strategy);
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
