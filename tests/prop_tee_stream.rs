// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Properties of the stream tee and the request cloner.

use std::io;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use shunttee::core::clone_headers;
use shunttee::filters::TeeFilterConfig;
use shunttee::stream::{ByteStream, tee_stream};

fn chunk_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop_vec(prop_vec(any::<u8>(), 1..256), 0..32)
}

fn header_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop_vec(("x-[a-z]{1,8}", "[a-zA-Z0-9 ]{0,16}"), 0..16)
}

async fn drain(mut s: ByteStream) -> io::Result<Vec<Bytes>> {
    let mut out = Vec::new();
    while let Some(chunk) = s.next().await {
        out.push(chunk?);
    }
    Ok(out)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Both sides see every chunk the source produced, in source order,
    /// whatever the pipe capacity.
    #[test]
    fn prop_tee_preserves_chunks_and_order(chunks in chunk_strategy(), capacity in 1usize..8) {
        let expected: Vec<Bytes> = chunks.iter().cloned().map(Bytes::from).collect();
        let source = stream::iter(expected.clone().into_iter().map(Ok::<_, io::Error>));

        let (primary, mirror) = runtime().block_on(async move {
            let (primary, mirror) = tee_stream(source, capacity);
            tokio::join!(drain(primary), drain(mirror))
        });

        prop_assert_eq!(primary.unwrap(), expected.clone());
        prop_assert_eq!(mirror.unwrap(), expected);
    }

    /// A cloned header map shares no state with its source, in either direction.
    #[test]
    fn prop_cloned_headers_are_independent(pairs in header_strategy()) {
        let mut original = HeaderMap::new();
        for (name, value) in &pairs {
            original.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        let before = original.clone();

        let mut copy = clone_headers(&original);
        prop_assert_eq!(&copy, &before);

        copy.append("x-only-in-copy", HeaderValue::from_static("1"));
        prop_assert_eq!(&original, &before);

        original.clear();
        prop_assert_eq!(copy.len(), before.len() + 1);
    }

    /// A rewrite whose pattern cannot match leaves the path unchanged.
    #[test]
    fn prop_rewrite_without_match_is_identity(path in "/[a-z0-9/]{0,32}") {
        let config = TeeFilterConfig::from_args(
            "tee",
            &json!(["http://shadow.internal", "^/NEVER-[A-Z]+", "/x"]),
        ).unwrap();
        let rewrite = config.rewrite.unwrap();
        prop_assert_eq!(rewrite.apply(&path), path);
    }
}
