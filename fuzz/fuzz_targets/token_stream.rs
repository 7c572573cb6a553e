//! Fuzz target for token stream parsing
//!
//! Decodes arbitrary header sections under each schema and re-encodes
//! whatever parses.

#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use rntbd_core::{ContextHeader, Header, RequestHeader, ResponseHeader, TokenStream};

fn roundtrip<H: Header>(data: &[u8]) {
    let Ok(stream) = TokenStream::<H>::decode(Bytes::copy_from_slice(data)) else {
        return;
    };
    for token in stream.present() {
        let _ = token.value();
    }
    let mut out = BytesMut::new();
    if stream.encode(&mut out).is_ok() {
        assert_eq!(out.len(), stream.compute_length());
    }
}

fuzz_target!(|data: &[u8]| {
    roundtrip::<RequestHeader>(data);
    roundtrip::<ResponseHeader>(data);
    roundtrip::<ContextHeader>(data);
});
