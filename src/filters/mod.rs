// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Built-in filters
//!
//! Filters are **opt-in** – you must reference them in the `filters` array of
//! a route for them to execute.
//!
//! | name          | stage | configuration                                  |
//! |---------------|-------|------------------------------------------------|
//! | `tee` / `Tee` | pre   | `[url]` or `[url, pattern, replacement]`       |
//! | `static`      | pre   | `{ "status": 200, "body": "", "headers": {} }` |

pub mod mirror;
pub mod tee;


pub use mirror::{MirrorDispatcher, MirrorHook, MirrorOutcome, MirrorSettings};
pub use tee::{PathRewrite, TeeFilter, TeeFilterConfig};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::core::{Filter, FilterType, ProxyContext, ProxyError, ProxyResponse};
use crate::{debug_fmt, error_fmt};

/// Constructor signature every dynamic filter must implement
pub type FilterConstructor = fn(serde_json::Value) -> Result<Arc<dyn Filter>, ProxyError>;

/// Global registry – `register_filter()` writes to it,
/// `FilterFactory::create_filter()` reads from it.
static FILTER_REGISTRY: Lazy<RwLock<HashMap<String, FilterConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a filter under a unique name.
///
/// ```rust
/// use shunttee::{filters::register_filter, Filter, FilterType};
///
/// #[derive(Debug)]
/// struct MyFilter;
///
/// #[async_trait::async_trait]
/// impl Filter for MyFilter {
///     fn filter_type(&self) -> FilterType { FilterType::Pre }
///     fn name(&self) -> &str { "my_filter" }
/// }
///
/// register_filter("my_filter", |_cfg| Ok(std::sync::Arc::new(MyFilter)));
/// ```
pub fn register_filter(name: &str, ctor: FilterConstructor) {
    FILTER_REGISTRY
        .write()
        .expect("FILTER_REGISTRY poisoned")
        .insert(name.to_string(), ctor);
}

fn get_registered_filter(name: &str) -> Option<FilterConstructor> {
    FILTER_REGISTRY
        .read()
        .expect("FILTER_REGISTRY poisoned")
        .get(name)
        .copied()
}

/// Configuration for the `static` filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFilterConfig {
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_status() -> u16 {
    200
}

/// Answers the request from configuration, so the backend is never called.
#[derive(Debug)]
pub struct StaticFilter {
    config: StaticFilterConfig,
}

impl StaticFilter {
    pub fn new(config: StaticFilterConfig) -> Result<Self, ProxyError> {
        for (name, value) in &config.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ProxyError::FilterError(format!("invalid header name '{name}': {e}"))
            })?;
            HeaderValue::from_str(value).map_err(|e| {
                ProxyError::FilterError(format!("invalid value for header '{name}': {e}"))
            })?;
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Filter for StaticFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        "static"
    }

    async fn pre_filter(&self, ctx: &mut ProxyContext) -> Result<(), ProxyError> {
        let mut response =
            ProxyResponse::new(self.config.status).with_body(self.config.body.clone());
        for (name, value) in &self.config.headers {
            response = response.with_header(name, value);
        }
        ctx.serve(response);
        Ok(())
    }
}

/// Factory for creating filters based on configuration.
#[derive(Debug)]
pub struct FilterFactory;

impl FilterFactory {
    /// Create a filter based on the filter type and configuration.
    pub fn create_filter(
        filter_type: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Filter>, ProxyError> {
        debug_fmt!(
            "Filter",
            "Creating filter of type '{}' with config: {}",
            filter_type,
            config
        );

        if let Some(ctor) = get_registered_filter(filter_type) {
            return ctor(config);
        }

        match filter_type {
            tee::NAME | tee::DEPRECATED_NAME => {
                Ok(Arc::new(TeeFilter::from_args(filter_type, &config)?))
            }
            "static" => {
                let config: StaticFilterConfig = serde_json::from_value(config).map_err(|e| {
                    let err = ProxyError::FilterError(format!("Invalid static filter config: {e}"));
                    error_fmt!("Filter", "{}", err);
                    err
                })?;
                Ok(Arc::new(StaticFilter::new(config)?))
            }
            _ => {
                let err = ProxyError::FilterError(format!("Unknown filter type: {filter_type}"));
                error_fmt!("Filter", "{}", err);
                Err(err)
            }
        }
    }
}
