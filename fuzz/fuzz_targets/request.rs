//! Fuzz target for request and context request decoding

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use rntbd_core::{ContextRequest, Request};

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    if let Ok(Some(request)) = Request::decode(&mut buf) {
        let mut out = BytesMut::new();
        let _ = request.encode(&mut out);
    }

    let mut buf = BytesMut::from(data);
    let _ = ContextRequest::decode(&mut buf);
});
