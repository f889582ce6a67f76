// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `tee` – mirror live traffic to a shadow backend.
//!
//! ```json
//! { "type": "tee", "config": ["http://shadow.internal:8080"] }
//! { "type": "tee", "config": ["http://shadow.internal", "^/v1/", "/v2/"] }
//! ```
//!
//! The first parameter is the shadow backend's base URL. The optional
//! second and third are a path regex and its replacement, applied with
//! replace-all to the mirrored path only (the query string is untouched).
//!
//! The mirrored request is a structural copy of the live one with the
//! shadow host and scheme. Its body is fed by a tee installed on the live
//! body, so the bytes reach the shadow backend as the primary backend
//! reads them. The shadow response is discarded and shadow failures are
//! only logged.

use std::mem;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HOST, HeaderValue};
use serde_json::Value;

use super::mirror::MirrorDispatcher;
use crate::core::route::authority;
use crate::core::{Filter, FilterType, ProxyContext, ProxyError, ProxyRequest};
use crate::stream::tee_body;
use crate::{error_fmt, trace_fmt, warn_fmt};

pub const NAME: &str = "tee";
pub const DEPRECATED_NAME: &str = "Tee";

/// Regex path rewrite applied to the mirrored request.
#[derive(Debug, Clone)]
pub struct PathRewrite {
    pub regex: Regex,
    pub replacement: String,
}

impl PathRewrite {
    pub fn apply(&self, path: &str) -> String {
        self.regex.replace_all(path, self.replacement.as_str()).into_owned()
    }
}

/// Validated `tee` parameters. Immutable once built.
#[derive(Debug, Clone)]
pub struct TeeFilterConfig {
    /// Authority of the shadow backend, port kept as written
    pub host: String,
    pub scheme: String,
    pub rewrite: Option<PathRewrite>,
}

fn invalid(name: &str, reason: impl std::fmt::Display) -> ProxyError {
    let err = ProxyError::FilterError(format!("invalid filter config in {name}: {reason}"));
    error_fmt!("TeeFilter", "{}", err);
    err
}

impl TeeFilterConfig {
    /// Parse the filter parameters: `[url]` or `[url, pattern, replacement]`.
    pub fn from_args(name: &str, args: &Value) -> Result<Self, ProxyError> {
        let args = args
            .as_array()
            .ok_or_else(|| invalid(name, "expecting a parameter list"))?;

        let backend = match args.first() {
            Some(Value::String(backend)) => backend,
            Some(other) => {
                return Err(invalid(
                    name,
                    format!("expecting backend url string, got: {other}"),
                ));
            }
            None => return Err(invalid(name, "missing backend url")),
        };

        let url = reqwest::Url::parse(backend)
            .map_err(|e| invalid(name, format!("invalid backend url '{backend}': {e}")))?;
        let host = authority(backend)
            .ok_or_else(|| invalid(name, format!("backend url '{backend}' has no host")))?;

        let rewrite = match args.len() {
            1 => None,
            3 => {
                let (Some(pattern), Some(replacement)) = (args[1].as_str(), args[2].as_str()) else {
                    return Err(invalid(
                        name,
                        format!("expecting regexp and string, got: {}", Value::Array(args.clone())),
                    ));
                };
                let regex = Regex::new(pattern)
                    .map_err(|e| invalid(name, format!("invalid regexp '{pattern}': {e}")))?;
                Some(PathRewrite {
                    regex,
                    replacement: replacement.to_string(),
                })
            }
            n => return Err(invalid(name, format!("expecting 1 or 3 parameters, got {n}"))),
        };

        Ok(Self {
            host: host.to_string(),
            scheme: url.scheme().to_string(),
            rewrite,
        })
    }
}

/// Mirrors each request to a shadow backend. Request stage only.
#[derive(Debug)]
pub struct TeeFilter {
    name: String,
    config: TeeFilterConfig,
    dispatcher: MirrorDispatcher,
}

impl TeeFilter {
    /// Build from filter parameters, using the shared dispatcher.
    pub fn from_args(name: &str, args: &Value) -> Result<Self, ProxyError> {
        let config = TeeFilterConfig::from_args(name, args)?;
        Ok(Self::with_dispatcher(name, config, MirrorDispatcher::shared()?))
    }

    pub fn with_dispatcher(
        name: &str,
        config: TeeFilterConfig,
        dispatcher: MirrorDispatcher,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            dispatcher,
        }
    }

    pub fn config(&self) -> &TeeFilterConfig {
        &self.config
    }

    /// Clone `request` for the shadow backend and tee its body.
    ///
    /// On success the live request's body has been replaced by the primary
    /// side of the tee, and the returned request carries the mirror side.
    /// On error the live request is untouched.
    pub fn mirror_request(
        &self,
        request: &mut ProxyRequest,
    ) -> Result<reqwest::Request, ProxyError> {
        let mut clone = request.clone_metadata();
        clone.host = self.config.host.clone();
        if let Some(rewrite) = &self.config.rewrite {
            clone.path = rewrite.apply(&clone.path);
        }

        let url = reqwest::Url::parse(&format!(
            "{}://{}{}",
            self.config.scheme,
            clone.host,
            clone.request_uri()
        ))
        .map_err(|e| ProxyError::FilterError(format!("cannot build mirror url: {e}")))?;
        let host = HeaderValue::from_str(&clone.host)
            .map_err(|e| ProxyError::FilterError(format!("invalid mirror host: {e}")))?;

        let original = mem::replace(&mut request.body, reqwest::Body::from(""));
        let (primary, mirror) = tee_body(original, self.dispatcher.settings().buffer_chunks);
        request.body = primary;

        clone.headers.insert(HOST, host);

        let mut outbound = reqwest::Request::new(clone.method, url);
        *outbound.headers_mut() = clone.headers;
        *outbound.body_mut() = Some(mirror);
        Ok(outbound)
    }
}

#[async_trait]
impl Filter for TeeFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Pre
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_filter(&self, ctx: &mut ProxyContext) -> Result<(), ProxyError> {
        let Some(permit) = self.dispatcher.try_reserve() else {
            warn_fmt!(
                "TeeFilter",
                "[{}] {} mirror requests in flight, not mirroring",
                ctx.id(),
                self.dispatcher.in_flight()
            );
            return Ok(());
        };

        match self.mirror_request(ctx.request_mut()) {
            Ok(outbound) => {
                trace_fmt!("TeeFilter", "[{}] mirroring to {}", ctx.id(), outbound.url());
                self.dispatcher.dispatch(permit, ctx.id().to_string(), outbound);
            }
            Err(e) => {
                warn_fmt!("TeeFilter", "[{}] not mirroring: {}", ctx.id(), e);
            }
        }

        Ok(())
    }
}
