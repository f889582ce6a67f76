// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route model and the router seam.
//!
//! Matching itself is left to whoever implements [`Router`]; this module
//! only describes what a matched route looks like and how one is built
//! from configuration.
//!
//! | `backend` value | [`RouteKind`]          |
//! |-----------------|------------------------|
//! | `"<shunt>"`     | `Shunt`                |
//! | `"<loopback>"`  | `Loopback`             |
//! | any URL         | `Network`              |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Filter, ProxyError, ProxyRequest};
use crate::error_fmt;
use crate::filters::FilterFactory;

pub const SHUNT_BACKEND: &str = "<shunt>";
pub const LOOPBACK_BACKEND: &str = "<loopback>";

/// Path-template variables captured by the router.
pub type PathParams = HashMap<String, String>;

/// How a matched route is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Forward to the declared backend
    Network,
    /// Answer inside the proxy, never contacting a backend
    Shunt,
    /// Re-run route matching, consuming one unit of loop budget
    Loopback,
}

/// A route that the proxy can apply to a request.
#[derive(Debug, Clone)]
pub struct Route {
    /// The ID of the route (for logging and reference)
    pub id: String,
    /// How requests on this route are answered
    pub kind: RouteKind,
    /// Base URL of the backend; empty for shunt and loopback routes
    pub backend: String,
    /// Host sent upstream unless the inbound host is preserved
    pub host: String,
    /// Filters applied on this route, in order
    pub filters: Vec<Arc<dyn Filter>>,
}

impl Route {
    /// Route to a network backend; the declared host is the URL's authority.
    pub fn network(id: &str, backend: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: RouteKind::Network,
            backend: backend.to_string(),
            host: authority(backend).unwrap_or_default().to_string(),
            filters: Vec::new(),
        }
    }

    pub fn shunt(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: RouteKind::Shunt,
            backend: String::new(),
            host: String::new(),
            filters: Vec::new(),
        }
    }

    pub fn loopback(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: RouteKind::Loopback,
            backend: String::new(),
            host: String::new(),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Build a route from its configuration.
    ///
    /// Every filter is created through [`FilterFactory`]; the first filter
    /// that fails to build rejects the whole route.
    pub fn from_config(config: &RouteConfig) -> Result<Self, ProxyError> {
        let mut route = match config.backend.as_str() {
            SHUNT_BACKEND => Route::shunt(&config.id),
            LOOPBACK_BACKEND => Route::loopback(&config.id),
            backend => {
                reqwest::Url::parse(backend).map_err(|e| {
                    let err = ProxyError::ConfigError(format!(
                        "route '{}': invalid backend '{}': {}",
                        config.id, backend, e
                    ));
                    error_fmt!("Route", "{}", err);
                    err
                })?;
                Route::network(&config.id, backend)
            }
        };

        if let Some(host) = &config.host {
            route.host = host.clone();
        }

        for filter_config in &config.filters {
            let filter =
                FilterFactory::create_filter(&filter_config.type_, filter_config.config.clone())
                    .map_err(|e| {
                        error_fmt!("Route", "Rejecting route '{}': {}", config.id, e);
                        e
                    })?;
            route.filters.push(filter);
        }

        Ok(route)
    }
}

/// Authority (host and port, as written) of an absolute URL.
///
/// The port is kept even when it is the scheme default, which URL
/// normalisation would otherwise drop.
pub(crate) fn authority(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    (!authority.is_empty()).then_some(authority)
}

/// Configuration for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// The ID of the route (for logging and reference)
    pub id: String,
    /// Backend URL, `<shunt>` or `<loopback>`
    pub backend: String,
    /// Overrides the host derived from the backend URL
    #[serde(default)]
    pub host: Option<String>,
    /// Filters to apply to this route
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

/// Configuration for a filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// The type of filter
    #[serde(rename = "type")]
    pub type_: String,
    /// The configuration for the filter
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The outcome of a successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Route,
    pub params: PathParams,
}

impl RouteMatch {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            params: PathParams::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// A router that matches requests to routes.
#[async_trait]
pub trait Router: fmt::Debug + Send + Sync {
    /// Find a route for the given request.
    async fn route(&self, request: &ProxyRequest) -> Result<RouteMatch, ProxyError>;
}
