// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mirroring through the full pipeline, with wiremock standing in for the
//! primary and shadow backends.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use shunttee::config::Config;
use shunttee::filters::{MirrorDispatcher, MirrorOutcome, MirrorSettings, TeeFilterConfig};
use shunttee::{HttpMethod, ProxyCore, ProxyRequest, ProxySettings, Route, RouteConfig, TeeFilter};
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{PrefixRouter, TestConfigProvider, body_text, recording_dispatcher};

fn tee_route(backend: &str, args: serde_json::Value, dispatcher: MirrorDispatcher) -> Route {
    let config = TeeFilterConfig::from_args("tee", &args).expect("tee config");
    let filter = TeeFilter::with_dispatcher("tee", config, dispatcher);
    Route::network("orders", backend).with_filter(Arc::new(filter))
}

fn proxy(route: Route) -> ProxyCore {
    ProxyCore::with_client(
        ProxySettings::default(),
        Arc::new(reqwest::Client::new()),
        Arc::new(PrefixRouter::default().with_route("/", route)),
    )
}

#[tokio::test]
async fn test_shadow_receives_rewritten_copy() {
    let primary = MockServer::start().await;
    let shadow = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .and(body_string("{\"qty\":3}"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .and(query_param("dry", "1"))
        .and(header("x-tenant", "acme"))
        .and(body_string("{\"qty\":3}"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&shadow)
        .await;

    let (dispatcher, outcomes) = recording_dispatcher(MirrorSettings::default());
    let args = json!([shadow.uri(), "^/v1/", "/v2/"]);
    let route = tee_route(&primary.uri(), args, dispatcher.clone());

    let request = ProxyRequest::new(HttpMethod::Post, "edge.example", "/v1/orders")
        .with_query("dry=1")
        .with_header("x-tenant", "acme")
        .with_body("{\"qty\":3}");

    let response = proxy(route).process_request(request).await.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(body_text(response.body).await, "created");

    dispatcher.wait_idle().await;
    let outcomes = outcomes.lock().unwrap();
    assert!(matches!(outcomes.as_slice(), [MirrorOutcome::Completed { status: 200, .. }]));
}

#[tokio::test]
async fn test_unreachable_shadow_does_not_affect_primary() {
    let primary = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&primary)
        .await;

    let (dispatcher, outcomes) = recording_dispatcher(MirrorSettings::default());
    let route = tee_route(&primary.uri(), json!(["http://127.0.0.1:1"]), dispatcher.clone());

    let request =
        ProxyRequest::new(HttpMethod::Put, "edge.example", "/orders/7").with_body("payload");
    let response = proxy(route).process_request(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(body_text(response.body).await, "ok");

    dispatcher.wait_idle().await;
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], MirrorOutcome::Failed { .. }));
}

#[tokio::test]
async fn test_slow_shadow_does_not_delay_primary() {
    let primary = MockServer::start().await;
    let shadow = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&primary)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&shadow)
        .await;

    let settings = MirrorSettings {
        timeout: 1,
        ..MirrorSettings::default()
    };
    let (dispatcher, outcomes) = recording_dispatcher(settings);
    let route = tee_route(&primary.uri(), json!([shadow.uri()]), dispatcher.clone());

    let started = Instant::now();
    let response = proxy(route)
        .process_request(ProxyRequest::new(HttpMethod::Get, "edge.example", "/"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(started.elapsed() < Duration::from_secs(1));

    dispatcher.wait_idle().await;
    let outcomes = outcomes.lock().unwrap();
    match &outcomes[0] {
        MirrorOutcome::Failed { error, .. } => assert!(error.contains("timed out")),
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shunted_request_still_dispatches_mirror() {
    let shadow = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&shadow)
        .await;

    let (dispatcher, outcomes) = recording_dispatcher(MirrorSettings::default());
    let config = TeeFilterConfig::from_args("tee", &json!([shadow.uri()])).unwrap();
    let answer =
        shunttee::FilterFactory::create_filter("static", json!({ "status": 204 })).unwrap();
    let route = Route::shunt("local")
        .with_filter(Arc::new(TeeFilter::with_dispatcher("tee", config, dispatcher.clone())))
        .with_filter(answer);

    let response = proxy(route)
        .process_request(ProxyRequest::new(HttpMethod::Get, "edge.example", "/health"))
        .await
        .unwrap();
    assert_eq!(response.status, 204);

    // the primary body was never read, so the mirror body ends early; the
    // mirror request is still dispatched and reported
    dispatcher.wait_idle().await;
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].request_id() == response.request_id.as_deref().unwrap());
}

#[tokio::test]
async fn test_routes_from_configuration() {
    let primary = MockServer::start().await;
    let shadow = MockServer::start().await;

    Mock::given(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_string("primary"))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(path("/items"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&shadow)
        .await;

    let route: RouteConfig = serde_json::from_value(json!({
        "id": "items",
        "backend": primary.uri(),
        "filters": [ { "type": "Tee", "config": [shadow.uri()] } ]
    }))
    .unwrap();

    let config = Config::builder()
        .with_provider(TestConfigProvider::from_json(json!({
            "proxy": { "timeout": 5, "mirror": { "max_in_flight": 4 } }
        })))
        .build();

    let router = PrefixRouter::from_configs(&[route]).unwrap();
    let core = ProxyCore::new(Arc::new(config), Arc::new(router)).await.unwrap();
    assert_eq!(core.settings.timeout, Duration::from_secs(5));

    let response = core
        .process_request(ProxyRequest::new(HttpMethod::Get, "edge.example", "/items"))
        .await
        .unwrap();
    assert_eq!(body_text(response.body).await, "primary");

    MirrorDispatcher::shared().unwrap().wait_idle().await;
}

#[test]
fn test_invalid_tee_rejects_route() {
    let route: RouteConfig = serde_json::from_value(json!({
        "id": "broken",
        "backend": "http://orders.internal",
        "filters": [ { "type": "tee", "config": ["http://shadow.internal", "^/v1/"] } ]
    }))
    .unwrap();

    assert!(Route::from_config(&route).is_err());
}
