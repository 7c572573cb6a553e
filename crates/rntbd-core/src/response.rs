//! Status frames and data-plane responses.
//!
//! ```text
//! ┌──────────┬──────────────┬───────────┬──────────────┬──────────────┐
//! │ length   │ headers len  │ status    │ activity id  │ header       │
//! │ u32 LE   │ u32 LE       │ u32 LE    │ 16, GUID     │ tokens       │
//! └──────────┴──────────────┴───────────┴──────────────┴──────────────┘
//!   [ payload length u32 LE | payload ]   only when PayloadPresent = 1
//! ```
//!
//! `length` equals the status frame size plus `headers len`.

use crate::error::{FrameError, TokenError};
use crate::headers::{Header, ResponseHeader};
use crate::token_stream::TokenStream;
use crate::validator::{
    LENGTH_PREFIX_SIZE, can_decode_head_with_limit, can_decode_payload_with_limit,
};
use crate::{MAX_FRAME_LENGTH, RESPONSE_STATUS_LENGTH, guid};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

/// Header name carrying the negotiated server version in mapped headers
pub const SERVER_VERSION_HEADER: &str = "ServerVersion";
/// Header name carrying the activity id in mapped headers
pub const ACTIVITY_ID_HEADER: &str = "ActivityId";

/// Fixed status frame shared by context responses and data responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStatus {
    /// Total frame length, including this prefix and the header section
    pub length: u32,
    /// Length of the header section
    pub headers_length: u32,
    /// HTTP-like status code
    pub status_code: u32,
    /// Correlation id
    pub activity_id: Uuid,
}

impl ResponseStatus {
    /// Build a status frame for a header section of `headers_length` bytes
    pub fn new(status_code: u32, activity_id: Uuid, headers_length: usize) -> Result<Self, FrameError> {
        let length = RESPONSE_STATUS_LENGTH + headers_length;
        if length > MAX_FRAME_LENGTH as usize {
            return Err(FrameError::LengthOutOfRange {
                length: length as u64,
                min: RESPONSE_STATUS_LENGTH as u64,
                max: u64::from(MAX_FRAME_LENGTH),
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            length: length as u32,
            headers_length: headers_length as u32,
            status_code,
            activity_id,
        })
    }

    /// Read a status frame
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        if buf.remaining() < RESPONSE_STATUS_LENGTH {
            return Err(FrameError::TooShort {
                expected: RESPONSE_STATUS_LENGTH,
                actual: buf.remaining(),
            });
        }

        let length = buf.get_u32_le();
        let headers_length = buf.get_u32_le();
        let status_code = buf.get_u32_le();
        let activity_id = guid::decode(buf)?;

        let observed = RESPONSE_STATUS_LENGTH as u64 + u64::from(headers_length);
        if u64::from(length) != observed {
            return Err(FrameError::LengthMismatch {
                declared: length as usize,
                observed: observed as usize,
            });
        }

        Ok(Self {
            length,
            headers_length,
            status_code,
            activity_id,
        })
    }

    /// Write the status frame
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.length);
        out.put_u32_le(self.headers_length);
        out.put_u32_le(self.status_code);
        guid::encode(&self.activity_id, out);
    }

    /// Whether the status is in the 2xx range
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A decoded status message: frame, header section and optional payload
pub(crate) struct StatusMessage<H: Header> {
    pub(crate) status: ResponseStatus,
    pub(crate) headers: TokenStream<H>,
    pub(crate) payload: Option<Bytes>,
}

/// Decode a status message from the front of `buf`.
///
/// `payload_flag` names the header that announces a payload section, if the
/// message kind can carry one. Nothing is consumed until the whole message,
/// payload included, is buffered.
pub(crate) fn decode_status_message<H: Header>(
    buf: &mut BytesMut,
    max_length: u32,
    payload_flag: Option<H>,
) -> Result<Option<StatusMessage<H>>, FrameError> {
    if !can_decode_head_with_limit(buf, max_length)? {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let headers_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if RESPONSE_STATUS_LENGTH + headers_length != length {
        return Err(FrameError::LengthMismatch {
            declared: length,
            observed: RESPONSE_STATUS_LENGTH + headers_length,
        });
    }

    let payload_present = match payload_flag {
        Some(flag) => TokenStream::<H>::peek(&buf[RESPONSE_STATUS_LENGTH..length], flag)?
            .is_some_and(|v| v.first().is_some_and(|b| *b != 0)),
        None => false,
    };
    if payload_present && !can_decode_payload_with_limit(buf, length, max_length)? {
        return Ok(None);
    }

    let mut head = buf.split_to(length).freeze();
    let status = ResponseStatus::decode(&mut head)?;
    let headers = TokenStream::<H>::decode(head)?;

    let payload = if payload_present {
        let len = buf.get_u32_le() as usize;
        Some(buf.split_to(len).freeze())
    } else {
        None
    };

    Ok(Some(StatusMessage {
        status,
        headers,
        payload,
    }))
}

/// Encode a status message. On error `out` is left as it was.
pub(crate) fn encode_status_message<H: Header>(
    status_code: u32,
    activity_id: Uuid,
    headers: &TokenStream<H>,
    payload: Option<&Bytes>,
    out: &mut BytesMut,
) -> Result<(), FrameError> {
    let headers_length = headers.compute_length();
    let status = ResponseStatus::new(status_code, activity_id, headers_length)?;

    let start = out.len();
    out.reserve(status.length as usize + payload.map_or(0, |p| p.len() + LENGTH_PREFIX_SIZE));
    status.encode(out);
    if let Err(e) = headers.encode(out) {
        out.truncate(start);
        return Err(e);
    }

    let observed = out.len() - start;
    if observed != status.length as usize {
        out.truncate(start);
        return Err(FrameError::LengthMismatch {
            declared: status.length as usize,
            observed,
        });
    }

    if let Some(payload) = payload {
        #[allow(clippy::cast_possible_truncation)]
        out.put_u32_le(payload.len() as u32);
        out.put_slice(payload);
    }
    Ok(())
}

/// Response headers flattened to name/value strings
///
/// The synthesized `ServerVersion` and `ActivityId` entries come first,
/// followed by present tokens in declaration order and then tokens the
/// schema does not declare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    /// Build from a header section
    pub fn from_stream<H: Header>(
        stream: &TokenStream<H>,
        server_version: &str,
        activity_id: Uuid,
    ) -> Result<Self, FrameError> {
        let mut entries = Vec::with_capacity(stream.compute_count() + 2);
        entries.push((SERVER_VERSION_HEADER.to_string(), server_version.to_string()));
        entries.push((ACTIVITY_ID_HEADER.to_string(), activity_id.to_string()));

        for token in stream.present() {
            let Some(value) = token.value()? else {
                continue;
            };
            let name = if H::from_id(token.id()).is_some() {
                token.name().to_string()
            } else {
                format!("{}(0x{:04X})", token.name(), token.id())
            };
            entries.push((name, value.to_string()));
        }

        Ok(Self { entries })
    }

    /// First value recorded under `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A data-plane response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: ResponseStatus,
    headers: TokenStream<ResponseHeader>,
    payload: Option<Bytes>,
}

impl Response {
    /// Build a response. `PayloadPresent` is set from `payload`.
    pub fn new(
        activity_id: Uuid,
        status_code: u32,
        mut headers: TokenStream<ResponseHeader>,
        payload: Option<Bytes>,
    ) -> Result<Self, TokenError> {
        headers.set(ResponseHeader::PayloadPresent, payload.is_some())?;
        let status = ResponseStatus {
            length: 0,
            headers_length: 0,
            status_code,
            activity_id,
        };
        let mut response = Self {
            status,
            headers,
            payload,
        };
        response.refresh_lengths();
        Ok(response)
    }

    fn refresh_lengths(&mut self) {
        let headers_length = self.headers.compute_length();
        #[allow(clippy::cast_possible_truncation)]
        {
            self.status.headers_length = headers_length as u32;
            self.status.length = (RESPONSE_STATUS_LENGTH + headers_length) as u32;
        }
    }

    /// Decode a response from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until the frame, its
    /// header section and any payload section are fully buffered. The
    /// payload is split off `buf` without copying.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        Self::decode_with_limit(buf, MAX_FRAME_LENGTH)
    }

    /// [`Response::decode`] with a caller-supplied frame length limit
    pub fn decode_with_limit(buf: &mut BytesMut, max_length: u32) -> Result<Option<Self>, FrameError> {
        let Some(message) =
            decode_status_message(buf, max_length, Some(ResponseHeader::PayloadPresent))?
        else {
            return Ok(None);
        };

        let response = Self {
            status: message.status,
            headers: message.headers,
            payload: message.payload,
        };
        tracing::trace!(
            activity_id = %response.activity_id(),
            status = response.status_code(),
            length = response.status.length,
            payload = response.payload.as_ref().map_or(0, Bytes::len),
            "Decoded response"
        );
        Ok(Some(response))
    }

    /// Serialize the response
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        encode_status_message(
            self.status.status_code,
            self.status.activity_id,
            &self.headers,
            self.payload.as_ref(),
            out,
        )
    }

    /// Status frame as decoded
    #[must_use]
    pub fn status(&self) -> &ResponseStatus {
        &self.status
    }

    /// Status code
    #[must_use]
    pub fn status_code(&self) -> u32 {
        self.status.status_code
    }

    /// Whether the status is in the 2xx range
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Correlation id
    #[must_use]
    pub fn activity_id(&self) -> Uuid {
        self.status.activity_id
    }

    /// Header tokens
    #[must_use]
    pub fn headers(&self) -> &TokenStream<ResponseHeader> {
        &self.headers
    }

    /// Payload, if the response carried one
    #[must_use]
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Take the payload
    #[must_use]
    pub fn into_payload(self) -> Option<Bytes> {
        self.payload
    }

    /// Backend sub-status; zero when absent
    pub fn sub_status(&self) -> Result<u32, FrameError> {
        Ok(self.headers.get(ResponseHeader::SubStatus).as_u32()?.unwrap_or(0))
    }

    /// Request charge, if reported
    pub fn request_charge(&self) -> Result<Option<f64>, FrameError> {
        self.headers.get(ResponseHeader::RequestCharge).as_f64()
    }

    /// Session token, if reported
    pub fn session_token(&self) -> Result<Option<&str>, FrameError> {
        self.headers.get(ResponseHeader::SessionToken).as_str()
    }

    /// Headers flattened to strings, with `server_version` synthesized first
    pub fn mapped_headers(&self, server_version: &str) -> Result<ResponseHeaders, FrameError> {
        ResponseHeaders::from_stream(&self.headers, server_version, self.activity_id())
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response({}, status {}, {} headers, {} payload bytes)",
            self.activity_id(),
            self.status_code(),
            self.headers.compute_count(),
            self.payload.as_ref().map_or(0, Bytes::len)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Option<&'static [u8]>) -> Response {
        let mut headers = TokenStream::<ResponseHeader>::new();
        headers
            .set(ResponseHeader::RequestCharge, 1.5f64)
            .unwrap()
            .set(ResponseHeader::SessionToken, "0:-1#9")
            .unwrap()
            .set(ResponseHeader::Lsn, 9i64)
            .unwrap();
        Response::new(Uuid::new_v4(), 200, headers, payload.map(Bytes::from_static)).unwrap()
    }

    #[test]
    fn test_status_frame_layout() {
        let response = sample(None);
        let mut out = BytesMut::new();
        response.encode(&mut out).unwrap();

        let length = u32::from_le_bytes([out[0], out[1], out[2], out[3]]) as usize;
        let headers_length = u32::from_le_bytes([out[4], out[5], out[6], out[7]]) as usize;
        assert_eq!(length, out.len());
        assert_eq!(length, RESPONSE_STATUS_LENGTH + headers_length);
        assert_eq!(&out[8..12], &200u32.to_le_bytes());
        assert_eq!(&out[12..28], &response.activity_id().to_bytes_le());
    }

    #[test]
    fn test_roundtrip_with_payload() {
        let response = sample(Some(b"{\"id\":\"doc\"}"));
        let mut out = BytesMut::new();
        response.encode(&mut out).unwrap();

        let decoded = Response::decode(&mut out).unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(decoded, response);
        assert_eq!(decoded.payload().unwrap().as_ref(), b"{\"id\":\"doc\"}");
        assert_eq!(decoded.request_charge().unwrap(), Some(1.5));
        assert_eq!(decoded.sub_status().unwrap(), 0);
    }

    #[test]
    fn test_decode_is_atomic_on_partial_input() {
        let response = sample(Some(b"0123456789"));
        let mut full = BytesMut::new();
        response.encode(&mut full).unwrap();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(Response::decode(&mut partial).unwrap().is_none(), "cut at {cut}");
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_decode_leaves_following_frame() {
        let first = sample(None);
        let second = sample(Some(b"x"));
        let mut out = BytesMut::new();
        first.encode(&mut out).unwrap();
        second.encode(&mut out).unwrap();

        assert_eq!(Response::decode(&mut out).unwrap().unwrap(), first);
        assert_eq!(Response::decode(&mut out).unwrap().unwrap(), second);
        assert!(Response::decode(&mut out).unwrap().is_none());
    }

    #[test]
    fn test_headers_length_mismatch() {
        let mut out = BytesMut::new();
        sample(None).encode(&mut out).unwrap();
        out[4..8].copy_from_slice(&1u32.to_le_bytes());

        assert!(matches!(
            Response::decode(&mut out),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_mapped_headers_order() {
        let response = sample(None);
        let mapped = response.mapped_headers("2.14.0.0").unwrap();
        let names: Vec<&str> = mapped.iter().map(|(n, _)| n).collect();

        assert_eq!(
            names,
            vec!["ServerVersion", "ActivityId", "PayloadPresent", "Lsn", "RequestCharge", "SessionToken"]
        );
        assert_eq!(mapped.get("ServerVersion"), Some("2.14.0.0"));
        assert_eq!(mapped.get("RequestCharge"), Some("1.5"));
        assert_eq!(
            mapped.get("ActivityId"),
            Some(response.activity_id().to_string().as_str())
        );
    }

    #[test]
    fn test_payload_shares_receive_buffer() {
        let response = sample(Some(b"shared payload bytes"));
        let mut out = BytesMut::new();
        response.encode(&mut out).unwrap();
        let frame_len = out.len();

        let decoded = Response::decode(&mut out).unwrap().unwrap();
        let payload = decoded.into_payload().unwrap();
        assert_eq!(payload.len(), 20);
        assert!(frame_len > payload.len());
    }
}
