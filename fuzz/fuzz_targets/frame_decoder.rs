//! Fuzz target for inbound frame decoding
//!
//! Feeds arbitrary bytes through the decoder in two slices. Decoding must
//! never panic, and an incomplete frame must leave the buffer untouched.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use rntbd_core::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let mut decoder = FrameDecoder::with_max_frame_length(1 << 20);
    let mut buf = BytesMut::new();

    for piece in [&data[..split], &data[split..]] {
        buf.extend_from_slice(piece);
        loop {
            let before = buf.len();
            match decoder.decode(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    assert_eq!(buf.len(), before);
                    break;
                }
                Err(_) => return,
            }
        }
    }
});
