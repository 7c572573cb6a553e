//! Error types for RNTBD connections.
//!
//! Errors are fanned out to every request waiting on a connection, so
//! [`TransportError`] is `Clone` and carries no borrowed I/O state.
//!
//! # Error Categories
//!
//! - **Fatal**: the connection is unusable (framing, negotiation, protocol
//!   violation, I/O); every pending request observes the same error.
//! - **Per-request**: a backend status or timeout affecting only the request
//!   it belongs to.
//! - **Cancellation**: the caller withdrew the request.

use rntbd_core::{BackendError, FrameError, TokenError};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by connections and their request manager
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Malformed frame read from or written to the wire
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Header value rejected while building a message
    #[error("Invalid header value: {0}")]
    Token(#[from] TokenError),

    /// The server rejected context negotiation
    #[error("Context negotiation failed: {0}")]
    Negotiation(Box<BackendError>),

    /// The server answered a request with a non-success status
    #[error("Backend error: {0}")]
    Backend(Box<BackendError>),

    /// The connection closed while the request was pending
    #[error("Connection closed with pending requests: {reason}")]
    ConnectionClosed {
        /// What closed the connection
        reason: Cow<'static, str>,
    },

    /// The request was cancelled before a response arrived
    #[error("Request cancelled")]
    Cancelled,

    /// No response within the configured request timeout
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Too many requests in flight on this connection
    #[error("Pending request limit of {limit} reached")]
    PendingLimitExceeded {
        /// Configured limit
        limit: usize,
    },

    /// The peer broke the protocol's message sequencing
    #[error("Protocol violation: {0}")]
    ProtocolViolation(Cow<'static, str>),

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// The connection is closed
    #[error("Connection is closed")]
    Closed,
}

impl TransportError {
    /// Whether this error leaves the connection unusable
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Frame(_)
                | Self::Negotiation(_)
                | Self::ProtocolViolation(_)
                | Self::Io(_)
                | Self::ConnectionClosed { .. }
                | Self::Closed
        )
    }

    /// Whether the request was withdrawn rather than failed
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The backend error, for negotiation and status failures
    #[must_use]
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Negotiation(e) | Self::Backend(e) => Some(e.as_ref()),
            _ => None,
        }
    }

    /// Create a connection-closed error with static context (zero allocation)
    #[must_use]
    pub const fn connection_closed(reason: &'static str) -> Self {
        Self::ConnectionClosed {
            reason: Cow::Borrowed(reason),
        }
    }

    /// Create a protocol violation with static context (zero allocation)
    #[must_use]
    pub const fn protocol_violation(context: &'static str) -> Self {
        Self::ProtocolViolation(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Self::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for connection operations
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rntbd_core::ErrorKind;
    use rntbd_core::ResponseHeaders;
    use uuid::Uuid;

    fn backend(kind: ErrorKind, status_code: u32) -> Box<BackendError> {
        Box::new(BackendError {
            kind,
            status_code,
            sub_status: 0,
            activity_id: Uuid::nil(),
            body: None,
            partition_key_range_id: None,
            lsn: None,
            partition_index: None,
            service_index: None,
            retry_after: None,
            headers: ResponseHeaders::default(),
        })
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::Frame(FrameError::InvalidTokenType(0x42)).is_fatal());
        assert!(TransportError::Negotiation(backend(ErrorKind::Unauthorized, 401)).is_fatal());
        assert!(TransportError::protocol_violation("second context").is_fatal());
        assert!(TransportError::Io("reset".into()).is_fatal());
        assert!(TransportError::connection_closed("eof").is_fatal());
    }

    #[test]
    fn test_per_request_errors() {
        assert!(!TransportError::Backend(backend(ErrorKind::NotFound, 404)).is_fatal());
        assert!(!TransportError::RequestTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!TransportError::PendingLimitExceeded { limit: 8 }.is_fatal());
        assert!(!TransportError::Cancelled.is_fatal());
    }

    #[test]
    fn test_cancellation_is_distinct() {
        assert!(TransportError::Cancelled.is_cancellation());
        assert!(!TransportError::connection_closed("eof").is_cancellation());
        assert!(!TransportError::RequestTimeout(Duration::from_millis(5)).is_cancellation());
    }

    #[test]
    fn test_backend_error_accessor() {
        let err = TransportError::Backend(backend(ErrorKind::Conflict, 409));
        assert_eq!(err.backend_error().map(|e| e.kind), Some(ErrorKind::Conflict));
        assert!(TransportError::Closed.backend_error().is_none());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(ref msg) if msg.contains("peer reset")));
    }
}
