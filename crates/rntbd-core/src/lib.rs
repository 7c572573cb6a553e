//! # RNTBD Core
//!
//! Wire format for the RNTBD direct-connectivity protocol: a binary,
//! length-framed request/response protocol with per-connection context
//! negotiation and 128-bit activity ids correlating requests to responses.
//!
//! This crate provides:
//! - Typed header tokens and token streams with lazy value parsing
//! - Header schemas for context and data-plane messages
//! - Frame availability checks for partially buffered input
//! - Context request/response and data request/response messages
//! - Mapping of non-success statuses to typed backend errors
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Messages                                      │
//! │   (context request/response, request, response)                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Token streams                                 │
//! │   (header sections declared by a schema)                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Tokens, GUIDs, length prefixes                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. No I/O happens here; see the transport
//! crate for connections.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod context;
pub mod error;
pub mod guid;
pub mod headers;
pub mod request;
pub mod response;
pub mod status;
pub mod token;
pub mod token_stream;
pub mod validator;

pub use codec::{FrameDecoder, InboundFrame};
pub use context::{ConnectionContext, ContextRequest, ContextResponse};
pub use error::{FrameError, TokenError};
pub use headers::{ContextHeader, ContextRequestHeader, Header, RequestHeader, ResponseHeader};
pub use request::{Operation, OperationType, Request, RequestFrame, ResourceType};
pub use response::{Response, ResponseHeaders, ResponseStatus};
pub use status::{BackendError, ErrorKind};
pub use token::{Token, TokenType, TokenValue};
pub use token_stream::TokenStream;

/// Protocol version sent in the context request
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Request frame size: length, activity id, operation type, resource type
pub const REQUEST_FRAME_LENGTH: usize = 28;

/// Status frame size: length, headers length, status code, activity id
pub const RESPONSE_STATUS_LENGTH: usize = 28;

/// Largest frame a length prefix may declare
pub const MAX_FRAME_LENGTH: u32 = i32::MAX as u32;
