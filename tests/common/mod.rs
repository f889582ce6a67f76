// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for the integration tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http_body_util::BodyExt;
use serde_json::Value;
use shunttee::config::{ConfigError, ConfigProvider};
use shunttee::filters::{MirrorDispatcher, MirrorOutcome, MirrorSettings};
use shunttee::{ProxyError, ProxyRequest, Route, RouteConfig, RouteMatch, Router};

/// Serves values out of one nested JSON document, keyed by dotted paths.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct TestConfigProvider {
    root: Value,
}

#[allow(dead_code)]
impl TestConfigProvider {
    pub fn from_json(root: Value) -> Self {
        Self { root }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.root, |node, part| node.get(part))
    }
}

impl ConfigProvider for TestConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    fn provider_name(&self) -> &str {
        "test"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lookup(key).cloned())
    }
}

/// Routes on path prefix, in declaration order.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct PrefixRouter {
    routes: Vec<(String, Route)>,
}

#[allow(dead_code)]
impl PrefixRouter {
    pub fn with_route(mut self, prefix: &str, route: Route) -> Self {
        self.routes.push((prefix.to_string(), route));
        self
    }

    /// Build every route from configuration, all under the `/` prefix.
    pub fn from_configs(configs: &[RouteConfig]) -> Result<Self, ProxyError> {
        let mut router = Self::default();
        for config in configs {
            router = router.with_route("/", Route::from_config(config)?);
        }
        Ok(router)
    }
}

#[async_trait]
impl Router for PrefixRouter {
    async fn route(&self, request: &ProxyRequest) -> Result<RouteMatch, ProxyError> {
        self.routes
            .iter()
            .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
            .map(|(_, route)| RouteMatch::new(route.clone()))
            .ok_or_else(|| ProxyError::RoutingError(format!("no route for {}", request.path)))
    }
}

/// A dispatcher whose outcomes are collected for assertions.
#[allow(dead_code)]
pub fn recording_dispatcher(
    settings: MirrorSettings,
) -> (MirrorDispatcher, Arc<Mutex<Vec<MirrorOutcome>>>) {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let dispatcher = MirrorDispatcher::new(settings)
        .expect("mirror client")
        .with_hook(Arc::new(move |outcome: &MirrorOutcome| {
            sink.lock().unwrap().push(outcome.clone());
        }));
    (dispatcher, outcomes)
}

#[allow(dead_code)]
pub async fn body_text(body: reqwest::Body) -> String {
    let bytes = body.collect().await.expect("body").to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}
