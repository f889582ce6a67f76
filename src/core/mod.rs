// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – requests, responses, filters & the pipeline driver.
//!
//! Everything that physically moves through the proxy pipeline is defined
//! in this module.  The per-request state lives in [`context`], the
//! body-less audit copies in [`snapshot`] and the route model in [`route`].

pub mod context;
pub mod route;
pub mod snapshot;


pub use context::{AuditRecord, Completion, CompletionKind, LoopGuard, ProxyContext, ResponseWriter};
pub use route::{FilterConfig, PathParams, Route, RouteConfig, RouteKind, RouteMatch, Router};
pub use snapshot::{RequestSnapshot, ResponseSnapshot, clone_headers};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, mem};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::Config;
use crate::filters::mirror::{MirrorDispatcher, MirrorSettings};
use crate::logging::{self, structured};
use crate::{debug_fmt, trace_fmt, warn_fmt};

/// Errors that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// HTTP client error
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Timeout error
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Router error
    #[error("routing error: {0}")]
    RoutingError(String),

    /// Loopback routes nested deeper than the configured budget
    #[error("loopback limit of {0} exceeded")]
    LoopLimitExceeded(usize),

    /// Filter error
    #[error("filter error: {0}")]
    FilterError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<crate::config::error::ConfigError> for ProxyError {
    fn from(err: crate::config::error::ConfigError) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

/// The standard HTTP methods, as a shorthand for building requests.
///
/// Requests carry a full [`reqwest::Method`], so extension methods such as
/// `PROPFIND` pass through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
        };
        f.write_str(name)
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Trace => reqwest::Method::TRACE,
            HttpMethod::Connect => reqwest::Method::CONNECT,
        }
    }
}

/// An inbound HTTP request as handed over by the listener.
///
/// `path` and `query` together form the request target; `host` is the
/// inbound `Host` value, kept separately from the header map the way the
/// listener reports it.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub version: reqwest::Version,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    pub remote_addr: Option<SocketAddr>,
}

impl ProxyRequest {
    /// Create a request with an empty body and no headers.
    pub fn new(method: impl Into<reqwest::Method>, host: &str, path: &str) -> Self {
        Self {
            method: method.into(),
            path: path.to_string(),
            query: None,
            host: host.to_string(),
            version: reqwest::Version::HTTP_11,
            headers: HeaderMap::new(),
            body: reqwest::Body::from(""),
            remote_addr: None,
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<reqwest::Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Path plus query, as it appears on the request line.
    pub fn request_uri(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }

    /// Structural copy of everything except the body.
    ///
    /// Bodies are single-consumption streams, so the copy carries an empty
    /// one. Headers are copied with [`clone_headers`], strings are owned.
    pub fn clone_metadata(&self) -> Self {
        Self {
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            host: self.host.clone(),
            version: self.version,
            headers: clone_headers(&self.headers),
            body: reqwest::Body::from(""),
            remote_addr: self.remote_addr,
        }
    }
}

/// Represents an HTTP response returned by the proxy.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub version: reqwest::Version,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    /// Id of the request this response answers, stamped when it is served.
    pub request_id: Option<String>,
}

impl ProxyResponse {
    /// A response with an empty header map and an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            version: reqwest::Version::HTTP_11,
            headers: HeaderMap::new(),
            body: reqwest::Body::from(""),
            request_id: None,
        }
    }

    /// The fallback used when nothing in the pipeline produced a response.
    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<reqwest::Body>) -> Self {
        self.body = body.into();
        self
    }
}

/// Describes when a filter should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Filter applied before the request is sent to the target
    Pre,
    /// Filter applied after the response is received from the target
    Post,
    /// Filter applied both before and after
    Both,
}

impl FilterType {
    /// Returns true if this is a pre-filter or both.
    pub fn is_pre(&self) -> bool {
        matches!(self, FilterType::Pre | FilterType::Both)
    }

    /// Returns true if this is a post-filter or both.
    pub fn is_post(&self) -> bool {
        matches!(self, FilterType::Post | FilterType::Both)
    }
}

/// A filter that processes requests and responses.
///
/// Both hooks receive the request's [`ProxyContext`]. A pre-filter may
/// rewrite the request, answer it through [`ProxyContext::serve`], or pass
/// data to later filters through the state bag.
#[async_trait]
pub trait Filter: fmt::Debug + Send + Sync {
    /// Get the filter type.
    fn filter_type(&self) -> FilterType;

    /// Get the filter name.
    fn name(&self) -> &str;

    /// Process a request before it is sent to the target.
    async fn pre_filter(&self, _ctx: &mut ProxyContext) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Process a response after it is received from the target.
    async fn post_filter(&self, _ctx: &mut ProxyContext) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Outbound HTTP transport used for backend calls and mirror dispatch.
#[async_trait]
pub trait UpstreamClient: fmt::Debug + Send + Sync {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, ProxyError>;
}

#[async_trait]
impl UpstreamClient for reqwest::Client {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, ProxyError> {
        reqwest::Client::execute(self, request)
            .await
            .map_err(ProxyError::ClientError)
    }
}

/// Observer invoked once per request with its audit record.
pub type AuditHook = Arc<dyn Fn(&AuditRecord) + Send + Sync>;

/// Settings read from the `proxy.*` configuration keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// Outbound request timeout
    pub timeout: Duration,
    /// Send the inbound host upstream instead of the route's host
    pub preserve_host: bool,
    /// Capture original request/response snapshots
    pub preserve_original: bool,
    /// Maximum loopback nesting depth
    pub max_loops: usize,
}

pub const DEFAULT_MAX_LOOPS: usize = 9;

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            preserve_host: false,
            preserve_original: false,
            max_loops: DEFAULT_MAX_LOOPS,
        }
    }
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let timeout_secs: u64 = config.get_or_default("proxy.timeout", 30)?;
        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            preserve_host: config.get_or_default("proxy.preserve_host", false)?,
            preserve_original: config.get_or_default("proxy.preserve_original", false)?,
            max_loops: config.get_or_default("proxy.max_loops", DEFAULT_MAX_LOOPS)?,
        })
    }
}

/// Drives a request through global filters, route application and
/// backend dispatch.
pub struct ProxyCore {
    /// Settings for the proxy
    pub settings: ProxySettings,
    /// Transport for outbound requests
    pub client: Arc<dyn UpstreamClient>,
    /// Router for matching requests to routes
    pub router: Arc<dyn Router>,
    /// Global filters that apply to all routes
    pub global_filters: Arc<RwLock<Vec<Arc<dyn Filter>>>>,
    audit_hook: Option<AuditHook>,
}

impl fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCore")
            .field("settings", &self.settings)
            .field("client", &self.client)
            .field("router", &self.router)
            .field("audit_hook", &self.audit_hook.is_some())
            .finish()
    }
}

impl ProxyCore {
    /// Create a new proxy core from configuration.
    ///
    /// Also installs the shared mirror dispatcher from `proxy.mirror.*` if
    /// no mirror filter has been created yet.
    pub async fn new(config: Arc<Config>, router: Arc<dyn Router>) -> Result<Self, ProxyError> {
        let settings = ProxySettings::from_config(&config)?;

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(ProxyError::ClientError)?;

        let mirror_settings: MirrorSettings =
            config.get_or_default("proxy.mirror", MirrorSettings::default())?;
        if !MirrorDispatcher::install_shared(mirror_settings)? {
            debug_fmt!("ProxyCore", "Mirror dispatcher already installed, keeping it");
        }

        Ok(Self::with_client(settings, Arc::new(client), router))
    }

    /// Create a proxy core around an existing transport.
    pub fn with_client(
        settings: ProxySettings,
        client: Arc<dyn UpstreamClient>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            settings,
            client,
            router,
            global_filters: Arc::new(RwLock::new(Vec::new())),
            audit_hook: None,
        }
    }

    /// Install an observer that receives every request's audit record.
    pub fn with_audit_hook(mut self, hook: AuditHook) -> Self {
        self.audit_hook = Some(hook);
        self
    }

    /// Add a global filter.
    pub async fn add_global_filter(&self, filter: Arc<dyn Filter>) {
        self.global_filters.write().await.push(filter);
    }

    /// Process a request through the proxy.
    ///
    /// Every successful run ends with a well-formed response: if nothing
    /// produced one, a 404 with empty headers and body is returned.
    pub async fn process_request(
        &self,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let mut ctx = ProxyContext::new(request, self.settings.preserve_original);
        let method = ctx.request().method.clone();
        let path = ctx.request().path.clone();

        let result = self.run(&mut ctx).await;
        if let Err(e) = &result {
            ctx.record_error(e);
        }

        if let Some(hook) = &self.audit_hook {
            hook(&ctx.audit());
        }

        let elapsed = ctx.started().elapsed();
        let request_id = ctx.id().to_string();
        let response = result.map(|_| ctx.into_response())?;

        if logging::is_structured_logging() {
            let log = structured::request_logger(
                &slog_scope::logger(),
                &request_id,
                method.as_str(),
                &path,
            );
            slog::debug!(log, "request completed";
                "status" => response.status,
                "elapsed_ms" => elapsed.as_millis() as u64);
        } else {
            debug_fmt!(
                "ProxyCore",
                "[{}] {} {} -> {} | total={:?}",
                request_id,
                method,
                path,
                response.status,
                elapsed
            );
        }

        Ok(response)
    }

    async fn run(&self, ctx: &mut ProxyContext) -> Result<(), ProxyError> {
        let globals = self.global_filters.read().await.clone();

        let ran = apply_pre_filters(&globals, ctx).await?;
        if !ctx.served() {
            self.route_request(ctx).await?;
        }

        ctx.ensure_default_response();
        apply_post_filters(&globals[..ran], ctx).await
    }

    /// Match a route, run its filters and dispatch by route kind.
    ///
    /// Loopback routes recurse under a [`LoopGuard`], so the loop counter
    /// is restored on every exit path.
    fn route_request<'a>(
        &'a self,
        ctx: &'a mut ProxyContext,
    ) -> BoxFuture<'a, Result<(), ProxyError>> {
        Box::pin(async move {
            let RouteMatch { route, params } = self.router.route(ctx.request()).await?;
            let filters = route.filters.clone();
            trace_fmt!("ProxyCore", "Applying route '{}' ({:?})", route.id, route.kind);
            ctx.apply_route(route, params, self.settings.preserve_host);

            let ran = apply_pre_filters(&filters, ctx).await?;

            if ctx.served() {
                debug_fmt!("ProxyCore", "Request served by a filter, skipping backend");
            } else if ctx.is_shunt_route() {
                ctx.ensure_default_response();
            } else if ctx.is_loopback_route() {
                if ctx.loop_counter() >= self.settings.max_loops {
                    warn_fmt!(
                        "ProxyCore",
                        "Loopback limit {} reached for {}",
                        self.settings.max_loops,
                        ctx.request().path
                    );
                    return Err(ProxyError::LoopLimitExceeded(self.settings.max_loops));
                }
                let mut guard = ctx.enter_loopback();
                self.route_request(&mut guard).await?;
            } else {
                self.forward(ctx).await?;
            }

            ctx.ensure_default_response();
            apply_post_filters(&filters[..ran], ctx).await
        })
    }

    /// Send the request to the applied route's backend.
    async fn forward(&self, ctx: &mut ProxyContext) -> Result<(), ProxyError> {
        let backend = ctx
            .backend_url()
            .ok_or_else(|| ProxyError::RoutingError("no backend for route".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let url = reqwest::Url::parse(&format!("{}{}", backend, ctx.request().request_uri()))
            .map_err(|e| {
                ProxyError::RoutingError(format!("invalid backend url '{backend}': {e}"))
            })?;

        let outgoing_host = HeaderValue::from_str(ctx.outgoing_host())
            .map_err(|e| ProxyError::RoutingError(format!("invalid outgoing host: {e}")))?;

        let request = ctx.request_mut();
        let mut headers = clone_headers(&request.headers);
        headers.insert(HOST, outgoing_host);

        let mut outbound = reqwest::Request::new(request.method.clone(), url);
        *outbound.headers_mut() = headers;
        *outbound.body_mut() = Some(mem::replace(&mut request.body, reqwest::Body::from("")));

        let upstream_start = Instant::now();
        let resp = timeout(self.settings.timeout, self.client.execute(outbound))
            .await
            .map_err(|_| ProxyError::Timeout(self.settings.timeout))??;

        let response = ProxyResponse {
            status: resp.status().as_u16(),
            version: resp.version(),
            headers: resp.headers().clone(),
            request_id: Some(ctx.id().to_string()),
            body: reqwest::Body::wrap_stream(resp.bytes_stream()),
        };

        trace_fmt!(
            "ProxyCore",
            "Backend {} answered {} in {:?}",
            backend,
            response.status,
            upstream_start.elapsed()
        );

        ctx.set_response(response);
        Ok(())
    }
}

/// Run pre-filters in order until one of them serves the request.
///
/// Returns how many filters ran, so the matching post-filters can be
/// applied to exactly those.
async fn apply_pre_filters(
    filters: &[Arc<dyn Filter>],
    ctx: &mut ProxyContext,
) -> Result<usize, ProxyError> {
    let mut ran = 0;
    for f in filters {
        ran += 1;
        if f.filter_type().is_pre() {
            f.pre_filter(ctx).await?;
        }
        if ctx.served() {
            break;
        }
    }
    Ok(ran)
}

/// Run post-filters in reverse order.
async fn apply_post_filters(
    filters: &[Arc<dyn Filter>],
    ctx: &mut ProxyContext,
) -> Result<(), ProxyError> {
    for f in filters.iter().rev() {
        if f.filter_type().is_post() {
            f.post_filter(ctx).await?;
        }
    }
    Ok(())
}
