//! Frame availability checks.
//!
//! These predicates are the only gate in front of a decoder: they look at the
//! bytes currently buffered and report whether a complete unit is available.
//! They never consume input. `Ok(false)` means "wait for more bytes";
//! `Err` means the length prefix itself is malformed and the connection is
//! unusable.

use crate::error::FrameError;
use crate::{MAX_FRAME_LENGTH, RESPONSE_STATUS_LENGTH};

/// Size of a length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

fn read_length(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + LENGTH_PREFIX_SIZE)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Whether a complete status frame plus header section is buffered.
///
/// The head is complete when at least [`RESPONSE_STATUS_LENGTH`] bytes are
/// available and the length prefix, which covers itself, is no larger than
/// what is buffered.
pub fn can_decode_head(buf: &[u8]) -> Result<bool, FrameError> {
    can_decode_head_with_limit(buf, MAX_FRAME_LENGTH)
}

/// [`can_decode_head`] with a caller-supplied upper bound on frame length.
pub fn can_decode_head_with_limit(buf: &[u8], max_length: u32) -> Result<bool, FrameError> {
    if buf.len() < RESPONSE_STATUS_LENGTH {
        return Ok(false);
    }

    let Some(length) = read_length(buf, 0) else {
        return Ok(false);
    };

    let max = max_length.min(MAX_FRAME_LENGTH);
    if (length as usize) < RESPONSE_STATUS_LENGTH || length > max {
        return Err(FrameError::LengthOutOfRange {
            length: u64::from(length),
            min: RESPONSE_STATUS_LENGTH as u64,
            max: u64::from(max),
        });
    }

    Ok(length as usize <= buf.len())
}

/// Whether a length-prefixed payload starting at `offset` is fully buffered.
pub fn can_decode_payload(buf: &[u8], offset: usize) -> Result<bool, FrameError> {
    can_decode_payload_with_limit(buf, offset, MAX_FRAME_LENGTH)
}

/// [`can_decode_payload`] with a caller-supplied upper bound on payload length.
pub fn can_decode_payload_with_limit(
    buf: &[u8],
    offset: usize,
    max_length: u32,
) -> Result<bool, FrameError> {
    let Some(length) = read_length(buf, offset) else {
        return Ok(false);
    };

    let max = max_length.min(MAX_FRAME_LENGTH);
    if length > max {
        return Err(FrameError::LengthOutOfRange {
            length: u64::from(length),
            min: 0,
            max: u64::from(max),
        });
    }

    Ok(buf.len() - offset - LENGTH_PREFIX_SIZE >= length as usize)
}
