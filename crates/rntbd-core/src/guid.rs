//! Activity id codec.
//!
//! Identifiers travel in the mixed-endian GUID layout used by the backend's
//! reference platform:
//!
//! ```text
//! ┌────────────┬──────────┬──────────┬─────────────────────────┐
//! │ data1      │ data2    │ data3    │ data4                   │
//! │ u32 LE     │ u16 LE   │ u16 LE   │ 8 bytes, as written     │
//! └────────────┴──────────┴──────────┴─────────────────────────┘
//! ```
//!
//! `data1..data3` form the 64 most significant bits of the identifier,
//! `data4` the 64 least significant bits in big-endian order. The layout is a
//! wire contract and must be reproduced bit for bit.

use crate::error::FrameError;
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Encoded size of an activity id
pub const GUID_SIZE: usize = 16;

/// Decode an activity id, advancing `buf` by [`GUID_SIZE`] bytes.
pub fn decode<B: Buf>(buf: &mut B) -> Result<Uuid, FrameError> {
    if buf.remaining() < GUID_SIZE {
        return Err(FrameError::TooShort {
            expected: GUID_SIZE,
            actual: buf.remaining(),
        });
    }

    let data1 = buf.get_u32_le();
    let data2 = buf.get_u16_le();
    let data3 = buf.get_u16_le();
    let mut data4 = [0u8; 8];
    buf.copy_to_slice(&mut data4);

    Ok(Uuid::from_fields(data1, data2, data3, &data4))
}

/// Encode an activity id.
pub fn encode<B: BufMut>(id: &Uuid, out: &mut B) {
    let (data1, data2, data3, data4) = id.as_fields();
    out.put_u32_le(data1);
    out.put_u16_le(data2);
    out.put_u16_le(data3);
    out.put_slice(data4);
}
