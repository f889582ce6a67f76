// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! shunt-tee – the request execution core of a filter-driven HTTP proxy.
//!
//! Every inbound request gets a [`ProxyContext`] that travels through global
//! filters, route application and backend dispatch. A filter can rewrite
//! the request, answer it itself ("shunt" it) through
//! [`ProxyContext::serve`], or pass data along in the context's state bag.
//!
//! # Route kinds
//!
//! - **network** – forward to the route's backend URL;
//! - **`<shunt>`** – never contact a backend, a filter supplies the answer
//!   (or the request gets an empty 404);
//! - **`<loopback>`** – re-run route matching, up to `proxy.max_loops` deep.
//!
//! # Traffic mirroring
//!
//! The `tee` filter copies each request to a shadow backend. The request
//! body is split by [`stream::tee_stream`], so the shadow backend receives
//! the same bytes as they are read by the primary one, and the mirrored
//! exchange runs fire-and-forget on a bounded [`filters::MirrorDispatcher`].
//!
//! ```json
//! {
//!   "id": "orders",
//!   "backend": "http://orders.internal:8080",
//!   "filters": [
//!     { "type": "tee", "config": ["http://orders-next.internal", "^/v1/", "/v2/"] }
//!   ]
//! }
//! ```
//!
//! # Custom filters
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use shunttee::{Filter, FilterType, ProxyContext, ProxyError, ProxyResponse};
//!
//! #[derive(Debug)]
//! struct Maintenance;
//!
//! #[async_trait]
//! impl Filter for Maintenance {
//!     fn filter_type(&self) -> FilterType {
//!         FilterType::Pre
//!     }
//!
//!     fn name(&self) -> &str {
//!         "maintenance"
//!     }
//!
//!     async fn pre_filter(&self, ctx: &mut ProxyContext) -> Result<(), ProxyError> {
//!         if ctx.request().path.starts_with("/admin") {
//!             ctx.serve(ProxyResponse::new(503).with_body("back soon"));
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod config;
pub mod core;
pub mod filters;
pub mod logging;
pub mod stream;

pub use config::{Config, ConfigError, ConfigProvider, ConfigProviderExt};
pub use core::{
    AuditRecord, Completion, Filter, FilterType, HttpMethod, ProxyContext, ProxyCore, ProxyError,
    ProxyRequest, ProxyResponse, ProxySettings, Route, RouteConfig, RouteKind, RouteMatch, Router,
    UpstreamClient,
};
pub use filters::{FilterFactory, MirrorDispatcher, StaticFilter, TeeFilter};
