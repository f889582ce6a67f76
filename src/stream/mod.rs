// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Non-buffering body tee.
//!
//! [`tee_stream`] wraps a byte stream so that every chunk the primary
//! consumer pulls is also pushed into a bounded pipe whose receiving end is
//! a second, independently read stream. The primary consumer drives the
//! copy; the mirror side never reads the source itself.
//!
//! * source chunk → written to the pipe, then returned to the primary
//! * source error → forwarded to the pipe, pipe closed, error returned
//! * source end   → pipe closed, mirror reader sees a normal end
//! * primary dropped early → mirror reader sees `UnexpectedEof` once the
//!   buffered chunks are drained
//! * pipe write failure (mirror reader gone) → logged, primary unaffected


use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use http_body_util::BodyExt;
use tokio::sync::mpsc;

use crate::{error_fmt, trace_fmt};

/// Boxed stream of body chunks, as produced by both ends of a tee.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Default number of chunks the pipe holds before the primary read waits.
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

struct TeeState<S> {
    source: S,
    sink: Option<mpsc::Sender<io::Result<Bytes>>>,
    // set once the pipe is closed on purpose, at source end or error
    closed: Arc<AtomicBool>,
}

impl<S> TeeState<S> {
    fn close(&mut self) -> Option<mpsc::Sender<io::Result<Bytes>>> {
        self.closed.store(true, Ordering::Release);
        self.sink.take()
    }
}

/// Split `source` into a primary stream and a mirror stream.
///
/// The pipe holds at most `capacity` chunks; once full, the primary read
/// waits for the mirror reader. Dropping the mirror stream turns the tee
/// into a pass-through.
pub fn tee_stream<S, E>(source: S, capacity: usize) -> (ByteStream, ByteStream)
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let closed = Arc::new(AtomicBool::new(false));
    let state = TeeState {
        source,
        sink: Some(tx),
        closed: closed.clone(),
    };

    let primary = stream::unfold(state, |mut state| async move {
        match state.source.next().await {
            Some(Ok(chunk)) => {
                if !chunk.is_empty() {
                    if let Some(sink) = &state.sink {
                        if sink.send(Ok(chunk.clone())).await.is_err() {
                            error_fmt!(
                                "StreamTee",
                                "error while tee request: mirror reader closed"
                            );
                            state.sink = None;
                        }
                    }
                }
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => {
                let err = io::Error::other(e);
                if let Some(sink) = state.close() {
                    let mirrored = io::Error::new(err.kind(), err.to_string());
                    if sink.send(Err(mirrored)).await.is_err() {
                        trace_fmt!("StreamTee", "mirror reader gone before source error");
                    }
                }
                Some((Err(err), state))
            }
            None => {
                state.close();
                None
            }
        }
    })
    .boxed();

    // a pipe that closes without the flag set means the primary side was
    // dropped mid-body; the mirror reader must not see a clean end
    let mirror = stream::unfold(Some((rx, closed)), |pipe| async move {
        let (mut rx, closed) = pipe?;
        match rx.recv().await {
            Some(item) => Some((item, Some((rx, closed)))),
            None if closed.load(Ordering::Acquire) => None,
            None => {
                trace_fmt!("StreamTee", "primary body dropped before end");
                let err = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "primary body dropped before end",
                );
                Some((Err(err), None))
            }
        }
    })
    .boxed();

    (primary, mirror)
}

/// Tee a request body.
///
/// Returns `(primary, mirror)`; the primary replaces the original body and
/// the mirror becomes the body of the cloned request.
pub fn tee_body(body: reqwest::Body, capacity: usize) -> (reqwest::Body, reqwest::Body) {
    let (primary, mirror) = tee_stream(body.into_data_stream(), capacity);
    (
        reqwest::Body::wrap_stream(primary),
        reqwest::Body::wrap_stream(mirror),
    )
}
