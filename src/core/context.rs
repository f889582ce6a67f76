// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-request execution context.
//!
//! A [`ProxyContext`] is created when a request arrives and is threaded
//! through every filter invocation until the response is written. It is
//! owned by the request's task and never shared.
//!
//! ```text
//!  new ──apply_route──▶ route-applied ──┬─ serve()        ─▶ ShuntedWithResponse
//!                         ▲     │       ├─ mark_served()  ─▶ ShuntedLegacy
//!                         └─────┘       └─ set_response() ─▶ proxied (Pending)
//!                        loopback
//! ```

use std::collections::HashMap;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use bytes::BytesMut;
use reqwest::header::HeaderMap;
use serde::Serialize;
use uuid::Uuid;

use super::snapshot::{RequestSnapshot, RequestSummary, ResponseSnapshot};
use super::{PathParams, ProxyError, ProxyRequest, ProxyResponse, Route, RouteKind};
use crate::{debug_fmt, trace_fmt, warn_fmt};

/// How far a request has got towards being answered.
#[derive(Debug, Default)]
pub enum Completion {
    /// Nothing has answered the request yet; a backend response, if any, is
    /// held separately.
    #[default]
    Pending,
    /// A filter or shunt logic supplied the response. Permanent.
    ShuntedWithResponse(ProxyResponse),
    /// A filter marked the request served and wrote through the
    /// [`ResponseWriter`] instead of supplying a response.
    ShuntedLegacy,
}

/// Data-free discriminant of [`Completion`], for audit output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Pending,
    ShuntedWithResponse,
    ShuntedLegacy,
}

impl Completion {
    pub fn kind(&self) -> CompletionKind {
        match self {
            Completion::Pending => CompletionKind::Pending,
            Completion::ShuntedWithResponse(_) => CompletionKind::ShuntedWithResponse,
            Completion::ShuntedLegacy => CompletionKind::ShuntedLegacy,
        }
    }
}

/// Output sink for filters using the legacy "mark served" completion mode.
#[derive(Debug)]
pub struct ResponseWriter {
    status: u16,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }
}

impl ResponseWriter {
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub fn written(&self) -> usize {
        self.body.len()
    }

    fn take_response(&mut self) -> ProxyResponse {
        let written = mem::take(self);
        let mut response = ProxyResponse::new(written.status);
        response.headers = written.headers;
        response.body = reqwest::Body::from(written.body.freeze());
        response
    }
}

/// The per-request state container passed to every pipeline stage.
#[derive(Debug)]
pub struct ProxyContext {
    id: String,
    request: ProxyRequest,
    response: Option<ProxyResponse>,
    completion: Completion,
    writer: ResponseWriter,
    route: Option<Route>,
    path_params: PathParams,
    state_bag: HashMap<String, serde_json::Value>,
    outgoing_host: String,
    loop_counter: usize,
    preserve_original: bool,
    original_request: Option<RequestSnapshot>,
    original_response: Option<ResponseSnapshot>,
    filter_errors: Vec<String>,
    started: Instant,
}

impl ProxyContext {
    /// Create the context for a freshly arrived request.
    ///
    /// With `preserve_original` the inbound metadata is snapshotted before
    /// any filter can touch it.
    pub fn new(request: ProxyRequest, preserve_original: bool) -> Self {
        let original_request = preserve_original.then(|| RequestSnapshot::capture(&request));
        Self {
            id: Uuid::new_v4().to_string(),
            outgoing_host: request.host.clone(),
            request,
            response: None,
            completion: Completion::Pending,
            writer: ResponseWriter::default(),
            route: None,
            path_params: PathParams::new(),
            state_bag: HashMap::new(),
            loop_counter: 0,
            preserve_original,
            original_request,
            original_response: None,
            filter_errors: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Unique id of this request, shared by its mirror log lines.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn request(&self) -> &ProxyRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut ProxyRequest {
        &mut self.request
    }

    /// Record a matched route.
    ///
    /// Path parameters are merged into the ones from earlier applications,
    /// new values winning on collision.
    pub fn apply_route(&mut self, route: Route, params: PathParams, preserve_host: bool) {
        self.outgoing_host = if preserve_host {
            self.request.host.clone()
        } else {
            route.host.clone()
        };
        self.path_params.extend(params);
        debug_fmt!(
            "ProxyContext",
            "[{}] route '{}' applied, outgoing host '{}'",
            self.id,
            route.id,
            self.outgoing_host
        );
        self.route = Some(route);
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn is_shunt_route(&self) -> bool {
        self.route.as_ref().is_some_and(|r| r.kind == RouteKind::Shunt)
    }

    pub fn is_loopback_route(&self) -> bool {
        self.route.as_ref().is_some_and(|r| r.kind == RouteKind::Loopback)
    }

    /// Backend of the applied network route.
    pub fn backend_url(&self) -> Option<&str> {
        self.route
            .as_ref()
            .filter(|r| r.kind == RouteKind::Network)
            .map(|r| r.backend.as_str())
    }

    pub fn loop_counter(&self) -> usize {
        self.loop_counter
    }

    /// Enter a nested loopback application.
    ///
    /// The counter is decremented when the guard drops, including on early
    /// return with `?`. Enforcing a maximum depth is up to the caller.
    pub fn enter_loopback(&mut self) -> LoopGuard<'_> {
        self.loop_counter += 1;
        trace_fmt!("ProxyContext", "[{}] loopback depth {}", self.id, self.loop_counter);
        LoopGuard { ctx: self }
    }

    pub fn path_param(&self, key: &str) -> Option<&str> {
        self.path_params.get(key).map(String::as_str)
    }

    pub fn path_params(&self) -> &PathParams {
        &self.path_params
    }

    /// Scratch space for passing data from one filter to a later one.
    pub fn state_bag(&self) -> &HashMap<String, serde_json::Value> {
        &self.state_bag
    }

    pub fn state_bag_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.state_bag
    }

    pub fn outgoing_host(&self) -> &str {
        &self.outgoing_host
    }

    pub fn set_outgoing_host(&mut self, host: &str) {
        self.outgoing_host = host.to_string();
    }

    pub fn original_request(&self) -> Option<&RequestSnapshot> {
        self.original_request.as_ref()
    }

    pub fn original_response(&self) -> Option<&ResponseSnapshot> {
        self.original_response.as_ref()
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// True once the request was answered in either completion mode.
    pub fn served(&self) -> bool {
        !matches!(self.completion, Completion::Pending)
    }

    /// True when a concrete response was supplied through [`serve`](Self::serve).
    pub fn shunted(&self) -> bool {
        matches!(self.completion, Completion::ShuntedWithResponse(_))
    }

    /// True when a filter used the legacy [`mark_served`](Self::mark_served).
    pub fn legacy_served(&self) -> bool {
        matches!(self.completion, Completion::ShuntedLegacy)
    }

    /// The live response: the served one if any, otherwise the backend's.
    pub fn response(&self) -> Option<&ProxyResponse> {
        match &self.completion {
            Completion::ShuntedWithResponse(response) => Some(response),
            _ => self.response.as_ref(),
        }
    }

    pub fn response_mut(&mut self) -> Option<&mut ProxyResponse> {
        match &mut self.completion {
            Completion::ShuntedWithResponse(response) => Some(response),
            _ => self.response.as_mut(),
        }
    }

    /// Store the backend response.
    ///
    /// Ignored once a response has been served, since a served response is
    /// never replaced.
    pub fn set_response(&mut self, response: ProxyResponse) {
        if self.shunted() {
            warn_fmt!(
                "ProxyContext",
                "[{}] request already served, dropping response with status {}",
                self.id,
                response.status
            );
            return;
        }
        if self.preserve_original {
            self.original_response = Some(ResponseSnapshot::capture(&response));
        }
        self.response = Some(response);
    }

    /// Answer the request with `response`, skipping the backend.
    ///
    /// The first served response wins; later calls are ignored. Serving
    /// after [`mark_served`](Self::mark_served) upgrades the legacy mode.
    pub fn serve(&mut self, mut response: ProxyResponse) {
        if self.shunted() {
            warn_fmt!(
                "ProxyContext",
                "[{}] request already served, ignoring second response",
                self.id
            );
            return;
        }
        response.request_id = Some(self.id.clone());
        if self.preserve_original {
            self.original_response = Some(ResponseSnapshot::capture(&response));
        }
        debug_fmt!("ProxyContext", "[{}] served with status {}", self.id, response.status);
        self.completion = Completion::ShuntedWithResponse(response);
    }

    /// Mark the request as served without supplying a response object.
    ///
    /// The filter writes its answer through [`response_writer`](Self::response_writer).
    pub fn mark_served(&mut self) {
        if matches!(self.completion, Completion::Pending) {
            debug_fmt!("ProxyContext", "[{}] marked served", self.id);
            self.completion = Completion::ShuntedLegacy;
        }
    }

    pub fn response_writer(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }

    /// Make sure a well-formed response exists.
    ///
    /// Legacy-served requests get the writer's contents; anything else that
    /// never produced a response gets an empty 404.
    pub fn ensure_default_response(&mut self) {
        match self.completion {
            Completion::ShuntedWithResponse(_) => {}
            Completion::ShuntedLegacy => {
                if self.response.is_none() {
                    let mut response = self.writer.take_response();
                    response.request_id = Some(self.id.clone());
                    self.response = Some(response);
                }
            }
            Completion::Pending => {
                if self.response.is_none() {
                    trace_fmt!("ProxyContext", "[{}] no response set, using default", self.id);
                    let mut response = ProxyResponse::not_found();
                    response.request_id = Some(self.id.clone());
                    self.response = Some(response);
                }
            }
        }
    }

    pub(crate) fn record_error(&mut self, err: &ProxyError) {
        self.filter_errors.push(err.to_string());
    }

    pub fn filter_errors(&self) -> &[String] {
        &self.filter_errors
    }

    /// Finalise and hand out the response.
    pub fn into_response(mut self) -> ProxyResponse {
        self.ensure_default_response();
        match self.completion {
            Completion::ShuntedWithResponse(response) => response,
            _ => self.response.unwrap_or_else(ProxyResponse::not_found),
        }
    }

    /// Point-in-time record for audit and debug observers.
    pub fn audit(&self) -> AuditRecord {
        AuditRecord {
            request_id: self.id.clone(),
            route_id: self.route.as_ref().map(|r| r.id.clone()),
            outgoing_host: self.outgoing_host.clone(),
            path_params: self.path_params.clone(),
            loop_depth: self.loop_counter,
            completion: self.completion.kind(),
            status: self.response().map(|r| r.status),
            original_request: self.original_request.clone(),
            original_response: self.original_response.clone(),
            errors: self.filter_errors.clone(),
        }
    }
}

/// Scope of one nested loopback application; see [`ProxyContext::enter_loopback`].
#[derive(Debug)]
pub struct LoopGuard<'a> {
    ctx: &'a mut ProxyContext,
}

impl Deref for LoopGuard<'_> {
    type Target = ProxyContext;

    fn deref(&self) -> &ProxyContext {
        self.ctx
    }
}

impl DerefMut for LoopGuard<'_> {
    fn deref_mut(&mut self) -> &mut ProxyContext {
        self.ctx
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.ctx.loop_counter -= 1;
    }
}

/// What an audit observer gets to see about a finished request.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub request_id: String,
    pub route_id: Option<String>,
    pub outgoing_host: String,
    pub path_params: PathParams,
    pub loop_depth: usize,
    pub completion: CompletionKind,
    pub status: Option<u16>,
    pub original_request: Option<RequestSnapshot>,
    pub original_response: Option<ResponseSnapshot>,
    pub errors: Vec<String>,
}

impl AuditRecord {
    /// JSON rendering for debug endpoints and log lines.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "request_id": self.request_id,
            "route_id": self.route_id,
            "outgoing_host": self.outgoing_host,
            "path_params": self.path_params,
            "loop_depth": self.loop_depth,
            "completion": self.completion,
            "status": self.status,
            "original_request": self.original_request.as_ref().map(RequestSummary::from),
            "original_status": self.original_response.as_ref().map(|r| r.status),
            "errors": self.errors,
        })
    }
}
