// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Body-less value copies of request and response metadata.
//!
//! Snapshots are built by pure functions from the live objects and never
//! share a header map with them, so later pipeline stages can mutate the
//! live request freely without touching what an auditor already captured.

use std::net::SocketAddr;

use reqwest::header::{CONTENT_LENGTH, HeaderMap, TRANSFER_ENCODING};
use serde::Serialize;

use super::{ProxyRequest, ProxyResponse};

/// Copy a header map entry by entry.
///
/// Every name gets its own value list in the same order as the source, so
/// inserting, appending or removing on either map never shows up in the
/// other.
pub fn clone_headers(headers: &HeaderMap) -> HeaderMap {
    let mut cloned = HeaderMap::with_capacity(headers.keys_len());
    for (name, value) in headers.iter() {
        cloned.append(name.clone(), value.clone());
    }
    cloned
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn transfer_encoding(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Frozen metadata of a request, captured for audit and debug observers.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: reqwest::Method,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub version: reqwest::Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestSnapshot {
    pub fn capture(request: &ProxyRequest) -> Self {
        Self {
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            host: request.host.clone(),
            version: request.version,
            headers: clone_headers(&request.headers),
            content_length: content_length(&request.headers),
            transfer_encoding: transfer_encoding(&request.headers),
            remote_addr: request.remote_addr,
        }
    }

    /// Header pairs in map order, for serialising into debug output.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        headers_to_pairs(&self.headers)
    }
}

/// Frozen metadata of a response.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub version: reqwest::Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    pub request_id: Option<String>,
}

impl ResponseSnapshot {
    pub fn capture(response: &ProxyResponse) -> Self {
        Self {
            status: response.status,
            version: response.version,
            headers: clone_headers(&response.headers),
            content_length: content_length(&response.headers),
            transfer_encoding: transfer_encoding(&response.headers),
            request_id: response.request_id.clone(),
        }
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        headers_to_pairs(&self.headers)
    }
}

/// Serialisable view of a [`RequestSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub method: String,
    pub uri: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
}

impl From<&RequestSnapshot> for RequestSummary {
    fn from(snapshot: &RequestSnapshot) -> Self {
        let uri = match &snapshot.query {
            Some(q) if !q.is_empty() => format!("{}?{}", snapshot.path, q),
            _ => snapshot.path.clone(),
        };
        Self {
            method: snapshot.method.to_string(),
            uri,
            host: snapshot.host.clone(),
            headers: snapshot.header_pairs(),
        }
    }
}
