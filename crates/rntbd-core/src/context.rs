//! Context negotiation messages.
//!
//! The client opens every connection with a [`ContextRequest`]; the first
//! frame the server sends back is a [`ContextResponse`]. Negotiated values
//! are captured once in a [`ConnectionContext`] and never change.

use crate::error::{FrameError, TokenError};
use crate::headers::{ContextHeader, ContextRequestHeader, Header};
use crate::request::{OperationType, RequestFrame, ResourceType};
use crate::response::{decode_status_message, encode_status_message};
use crate::token_stream::TokenStream;
use crate::validator::LENGTH_PREFIX_SIZE;
use crate::{MAX_FRAME_LENGTH, PROTOCOL_VERSION, REQUEST_FRAME_LENGTH};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// First frame written on a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    activity_id: Uuid,
    headers: TokenStream<ContextRequestHeader>,
}

impl ContextRequest {
    /// Create a context request for the current protocol version
    pub fn new(activity_id: Uuid, client_version: &str, user_agent: &str) -> Result<Self, TokenError> {
        Self::with_protocol_version(activity_id, PROTOCOL_VERSION, client_version, user_agent)
    }

    /// Create a context request for an explicit protocol version
    pub fn with_protocol_version(
        activity_id: Uuid,
        protocol_version: u32,
        client_version: &str,
        user_agent: &str,
    ) -> Result<Self, TokenError> {
        let mut headers = TokenStream::new();
        headers
            .set(ContextRequestHeader::ProtocolVersion, protocol_version)?
            .set(ContextRequestHeader::ClientVersion, client_version)?
            .set(ContextRequestHeader::UserAgent, user_agent)?;

        Ok(Self {
            activity_id,
            headers,
        })
    }

    /// Attach a credential
    pub fn with_authorization(mut self, token: &str) -> Result<Self, TokenError> {
        self.headers.set(ContextRequestHeader::AuthorizationToken, token)?;
        Ok(self)
    }

    /// Correlation id
    #[must_use]
    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Header tokens
    #[must_use]
    pub fn headers(&self) -> &TokenStream<ContextRequestHeader> {
        &self.headers
    }

    /// Length declared by the length prefix
    #[must_use]
    pub fn encoded_length(&self) -> usize {
        REQUEST_FRAME_LENGTH + self.headers.compute_length()
    }

    /// Serialize the request. On error `out` is left as it was.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        let length = self.encoded_length();
        if length > MAX_FRAME_LENGTH as usize {
            return Err(FrameError::LengthOutOfRange {
                length: length as u64,
                min: REQUEST_FRAME_LENGTH as u64,
                max: u64::from(MAX_FRAME_LENGTH),
            });
        }

        let start = out.len();
        out.reserve(length);
        #[allow(clippy::cast_possible_truncation)]
        out.put_u32_le(length as u32);
        RequestFrame::connection(self.activity_id).encode(out);
        if let Err(e) = self.headers.encode(out) {
            out.truncate(start);
            return Err(e);
        }

        let observed = out.len() - start;
        if observed != length {
            out.truncate(start);
            return Err(FrameError::LengthMismatch {
                declared: length,
                observed,
            });
        }
        Ok(())
    }

    /// Decode a context request from the front of `buf`.
    ///
    /// Returns `Ok(None)` until the whole frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (declared as usize) < REQUEST_FRAME_LENGTH || declared > MAX_FRAME_LENGTH {
            return Err(FrameError::LengthOutOfRange {
                length: u64::from(declared),
                min: REQUEST_FRAME_LENGTH as u64,
                max: u64::from(MAX_FRAME_LENGTH),
            });
        }
        let declared = declared as usize;
        if buf.len() < declared {
            return Ok(None);
        }

        let mut head = buf.split_to(declared).freeze();
        head.advance(LENGTH_PREFIX_SIZE);
        let frame = RequestFrame::decode(&mut head)?;
        if frame.operation_type != OperationType::Connection {
            return Err(FrameError::UnknownOperationType(u32::from(frame.operation_type.id())));
        }
        if frame.resource_type != ResourceType::Connection {
            return Err(FrameError::UnknownResourceType(u32::from(frame.resource_type.id())));
        }
        let headers = TokenStream::<ContextRequestHeader>::decode(head)?;

        let request = Self {
            activity_id: frame.activity_id,
            headers,
        };
        let observed = request.encoded_length();
        if observed != declared {
            return Err(FrameError::LengthMismatch { declared, observed });
        }
        Ok(Some(request))
    }
}

/// First frame received on a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ContextResponse {
    status_code: u32,
    activity_id: Uuid,
    headers: TokenStream<ContextHeader>,
}

impl ContextResponse {
    /// Create a context response
    #[must_use]
    pub fn new(activity_id: Uuid, status_code: u32, headers: TokenStream<ContextHeader>) -> Self {
        Self {
            status_code,
            activity_id,
            headers,
        }
    }

    /// Accepting response carrying the mandatory server identification
    pub fn accepted(
        activity_id: Uuid,
        server_agent: &str,
        server_version: &str,
    ) -> Result<Self, TokenError> {
        let mut headers = TokenStream::new();
        headers
            .set(ContextHeader::ProtocolVersion, PROTOCOL_VERSION)?
            .set(ContextHeader::ServerAgent, server_agent)?
            .set(ContextHeader::ServerVersion, server_version)?;
        Ok(Self::new(activity_id, 200, headers))
    }

    /// Status code
    #[must_use]
    pub fn status_code(&self) -> u32 {
        self.status_code
    }

    /// Whether the server accepted the context
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Correlation id
    #[must_use]
    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Header tokens
    #[must_use]
    pub fn headers(&self) -> &TokenStream<ContextHeader> {
        &self.headers
    }

    /// Header tokens, mutably
    pub fn headers_mut(&mut self) -> &mut TokenStream<ContextHeader> {
        &mut self.headers
    }

    /// Serialize the response
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        encode_status_message(self.status_code, self.activity_id, &self.headers, None, out)
    }

    /// Decode a context response from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until the frame is
    /// fully buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        Self::decode_with_limit(buf, MAX_FRAME_LENGTH)
    }

    /// [`ContextResponse::decode`] with a caller-supplied frame length limit
    pub fn decode_with_limit(buf: &mut BytesMut, max_length: u32) -> Result<Option<Self>, FrameError> {
        Ok(
            decode_status_message::<ContextHeader>(buf, max_length, None)?.map(|message| Self {
                status_code: message.status.status_code,
                activity_id: message.status.activity_id,
                headers: message.headers,
            }),
        )
    }
}

fn required_str(
    headers: &TokenStream<ContextHeader>,
    header: ContextHeader,
) -> Result<&str, FrameError> {
    headers
        .get(header)
        .as_str()?
        .ok_or(FrameError::MissingRequiredToken {
            id: header.id(),
            name: header.name(),
        })
}

/// Values negotiated for the lifetime of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    protocol_version: u32,
    client_version: Option<String>,
    server_agent: String,
    server_version: Arc<str>,
    idle_timeout: Option<Duration>,
    unauthenticated_timeout: Option<Duration>,
    negotiated_at: Instant,
}

impl ConnectionContext {
    /// Capture the context from an accepting response.
    ///
    /// # Errors
    ///
    /// An accepting response must identify the server; a missing
    /// `ServerAgent` or `ServerVersion` is a framing error.
    pub fn from_response(response: &ContextResponse) -> Result<Self, FrameError> {
        let headers = response.headers();
        let seconds = |h: ContextHeader| -> Result<Option<Duration>, FrameError> {
            Ok(headers
                .get(h)
                .as_u32()?
                .filter(|s| *s > 0)
                .map(|s| Duration::from_secs(u64::from(s))))
        };

        Ok(Self {
            protocol_version: headers
                .get(ContextHeader::ProtocolVersion)
                .as_u32()?
                .unwrap_or(PROTOCOL_VERSION),
            client_version: headers
                .get(ContextHeader::ClientVersion)
                .as_str()?
                .map(str::to_string),
            server_agent: required_str(headers, ContextHeader::ServerAgent)?.to_string(),
            server_version: Arc::from(required_str(headers, ContextHeader::ServerVersion)?),
            idle_timeout: seconds(ContextHeader::IdleTimeoutInSeconds)?,
            unauthenticated_timeout: seconds(ContextHeader::UnauthenticatedTimeoutInSeconds)?,
            negotiated_at: Instant::now(),
        })
    }

    /// Protocol version in effect
    #[must_use]
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Client version echoed by the server
    #[must_use]
    pub fn client_version(&self) -> Option<&str> {
        self.client_version.as_deref()
    }

    /// Server agent
    #[must_use]
    pub fn server_agent(&self) -> &str {
        &self.server_agent
    }

    /// Server version, synthesized into every mapped response header set
    #[must_use]
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Idle timeout advertised by the server
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Unauthenticated timeout advertised by the server
    #[must_use]
    pub fn unauthenticated_timeout(&self) -> Option<Duration> {
        self.unauthenticated_timeout
    }

    /// When negotiation completed
    #[must_use]
    pub fn negotiated_at(&self) -> Instant {
        self.negotiated_at
    }
}
