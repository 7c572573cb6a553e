//! Data-plane requests.
//!
//! ```text
//! ┌──────────┬──────────────┬───────────┬───────────┬──────────────┐
//! │ length   │ activity id  │ operation │ resource  │ header       │
//! │ u32 LE   │ 16, GUID     │ u32 LE    │ u32 LE    │ tokens       │
//! └──────────┴──────────────┴───────────┴───────────┴──────────────┘
//!   [ payload length u32 LE | payload ]   only when PayloadPresent = 1
//! ```
//!
//! `length` covers the frame and header tokens, not the payload section.

use crate::error::{FrameError, TokenError};
use crate::headers::RequestHeader;
use crate::token::TokenValue;
use crate::token_stream::TokenStream;
use crate::validator::LENGTH_PREFIX_SIZE;
use crate::{MAX_FRAME_LENGTH, REQUEST_FRAME_LENGTH, guid};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

macro_rules! define_wire_enum {
    (
        $(#[$enum_meta:meta])*
        pub enum $name:ident ($err:ident) {
            $( $(#[$meta:meta])* $variant:ident = $id:literal, )*
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum $name {
            $( $(#[$meta])* $variant = $id, )*
        }

        impl $name {
            /// Wire identifier
            #[must_use]
            pub fn id(self) -> u16 {
                self as u16
            }
        }

        impl TryFrom<u32> for $name {
            type Error = FrameError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $( $id => Ok(Self::$variant), )*
                    _ => Err(FrameError::$err(value)),
                }
            }
        }
    };
}

define_wire_enum! {
    /// Operation carried by a request
    pub enum OperationType (UnknownOperationType) {
        /// Context negotiation
        Connection = 0x0000,
        /// Create a resource
        Create = 0x0001,
        /// Patch a resource
        Update = 0x0002,
        /// Read a resource
        Read = 0x0003,
        /// Read a feed of resources
        ReadFeed = 0x0004,
        /// Delete a resource
        Delete = 0x0005,
        /// Replace a resource
        Replace = 0x0006,
        /// Execute a stored procedure
        ExecuteJavaScript = 0x0008,
        /// Query
        Query = 0x0009,
        /// Metadata-only read
        Head = 0x0012,
        /// Metadata-only feed read
        HeadFeed = 0x0013,
        /// Create or replace
        Upsert = 0x0014,
        /// Transactional batch
        Batch = 0x0025,
    }
}

define_wire_enum! {
    /// Resource addressed by a request
    pub enum ResourceType (UnknownResourceType) {
        /// Context negotiation
        Connection = 0x0000,
        /// Database
        Database = 0x0001,
        /// Collection
        Collection = 0x0002,
        /// Document
        Document = 0x0003,
        /// Attachment
        Attachment = 0x0004,
        /// User
        User = 0x0005,
        /// Permission
        Permission = 0x0006,
        /// Stored procedure
        StoredProcedure = 0x0007,
        /// Conflict
        Conflict = 0x0008,
        /// Trigger
        Trigger = 0x0009,
        /// User-defined function
        UserDefinedFunction = 0x000A,
        /// Database account
        DatabaseAccount = 0x0012,
        /// Partition key range
        PartitionKeyRange = 0x0016,
    }
}

/// Fixed request frame, excluding the length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    /// Correlation id
    pub activity_id: Uuid,
    /// Operation
    pub operation_type: OperationType,
    /// Resource
    pub resource_type: ResourceType,
}

impl RequestFrame {
    /// Create a frame
    #[must_use]
    pub fn new(activity_id: Uuid, operation_type: OperationType, resource_type: ResourceType) -> Self {
        Self {
            activity_id,
            operation_type,
            resource_type,
        }
    }

    /// Frame used by context negotiation
    #[must_use]
    pub fn connection(activity_id: Uuid) -> Self {
        Self::new(activity_id, OperationType::Connection, ResourceType::Connection)
    }

    /// Write the frame fields that follow the length prefix
    pub fn encode(&self, out: &mut BytesMut) {
        guid::encode(&self.activity_id, out);
        out.put_u32_le(u32::from(self.operation_type.id()));
        out.put_u32_le(u32::from(self.resource_type.id()));
    }

    /// Read the frame fields that follow the length prefix
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        let needed = REQUEST_FRAME_LENGTH - LENGTH_PREFIX_SIZE;
        if buf.remaining() < needed {
            return Err(FrameError::TooShort {
                expected: needed,
                actual: buf.remaining(),
            });
        }

        let activity_id = guid::decode(buf)?;
        let operation_type = OperationType::try_from(buf.get_u32_le())?;
        let resource_type = ResourceType::try_from(buf.get_u32_le())?;
        Ok(Self::new(activity_id, operation_type, resource_type))
    }
}

/// Outbound logical operation, before an activity id is assigned
#[derive(Debug, Clone)]
pub struct Operation {
    operation_type: OperationType,
    resource_type: ResourceType,
    headers: TokenStream<RequestHeader>,
    payload: Bytes,
}

impl Operation {
    /// Create an operation with no headers and no payload
    #[must_use]
    pub fn new(operation_type: OperationType, resource_type: ResourceType) -> Self {
        Self {
            operation_type,
            resource_type,
            headers: TokenStream::new(),
            payload: Bytes::new(),
        }
    }

    /// Set a request header
    pub fn with_header(
        mut self,
        header: RequestHeader,
        value: impl Into<TokenValue>,
    ) -> Result<Self, TokenError> {
        self.headers.set(header, value)?;
        Ok(self)
    }

    /// Attach a payload
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Operation type
    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// Resource type
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Request headers
    pub fn headers_mut(&mut self) -> &mut TokenStream<RequestHeader> {
        &mut self.headers
    }
}

/// A request ready to be written to the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    frame: RequestFrame,
    headers: TokenStream<RequestHeader>,
    payload: Bytes,
}

impl Request {
    /// Bind an operation to an activity id.
    ///
    /// Sets `PayloadPresent` from the operation's payload.
    pub fn new(activity_id: Uuid, operation: Operation) -> Result<Self, TokenError> {
        let Operation {
            operation_type,
            resource_type,
            mut headers,
            payload,
        } = operation;

        headers.set(RequestHeader::PayloadPresent, !payload.is_empty())?;

        Ok(Self {
            frame: RequestFrame::new(activity_id, operation_type, resource_type),
            headers,
            payload,
        })
    }

    /// Fixed frame
    #[must_use]
    pub fn frame(&self) -> &RequestFrame {
        &self.frame
    }

    /// Correlation id
    #[must_use]
    pub fn activity_id(&self) -> Uuid {
        self.frame.activity_id
    }

    /// Header tokens
    #[must_use]
    pub fn headers(&self) -> &TokenStream<RequestHeader> {
        &self.headers
    }

    /// Payload; empty when none
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Length declared by the frame's length prefix
    #[must_use]
    pub fn encoded_length(&self) -> usize {
        REQUEST_FRAME_LENGTH + self.headers.compute_length()
    }

    /// Serialize the request.
    ///
    /// # Errors
    ///
    /// Fails if a required header is missing, the frame is too large, or the
    /// bytes written disagree with the precomputed length. On error `out` is
    /// left as it was.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        let expected = self.encoded_length();
        if expected > MAX_FRAME_LENGTH as usize {
            return Err(FrameError::LengthOutOfRange {
                length: expected as u64,
                min: REQUEST_FRAME_LENGTH as u64,
                max: u64::from(MAX_FRAME_LENGTH),
            });
        }

        let start = out.len();
        out.reserve(expected + LENGTH_PREFIX_SIZE + self.payload.len());
        out.put_u32_le(0);
        self.frame.encode(out);
        if let Err(e) = self.headers.encode(out) {
            out.truncate(start);
            return Err(e);
        }

        let observed = out.len() - start;
        if observed != expected {
            out.truncate(start);
            return Err(FrameError::LengthMismatch {
                declared: expected,
                observed,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        out[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&(observed as u32).to_le_bytes());

        if !self.payload.is_empty() {
            #[allow(clippy::cast_possible_truncation)]
            out.put_u32_le(self.payload.len() as u32);
            out.put_slice(&self.payload);
        }
        Ok(())
    }

    /// Decode a request from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when the request or its
    /// payload section is not fully buffered yet.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (length as usize) < REQUEST_FRAME_LENGTH || length > MAX_FRAME_LENGTH {
            return Err(FrameError::LengthOutOfRange {
                length: u64::from(length),
                min: REQUEST_FRAME_LENGTH as u64,
                max: u64::from(MAX_FRAME_LENGTH),
            });
        }
        let length = length as usize;
        if buf.len() < length {
            return Ok(None);
        }

        let payload_present = TokenStream::peek(
            &buf[REQUEST_FRAME_LENGTH..length],
            RequestHeader::PayloadPresent,
        )?
        .is_some_and(|flag| flag.first().is_some_and(|b| *b != 0));

        if payload_present && !crate::validator::can_decode_payload(buf, length)? {
            return Ok(None);
        }

        let mut head = buf.split_to(length).freeze();
        head.advance(LENGTH_PREFIX_SIZE);
        let frame = RequestFrame::decode(&mut head)?;
        let headers = TokenStream::<RequestHeader>::decode(head)?;

        let payload = if payload_present {
            let len = buf.get_u32_le() as usize;
            buf.split_to(len).freeze()
        } else {
            Bytes::new()
        };

        Ok(Some(Self {
            frame,
            headers,
            payload,
        }))
    }
}
