//! Error types for the RNTBD wire protocol core.

use crate::token::TokenType;
use thiserror::Error;

/// Frame-level errors
///
/// Every variant describes a structural problem with bytes read from or
/// written to the wire. A connection that observes one of these cannot
/// recover its framing and must be torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a fixed-size structure requires
    #[error("invalid frame length: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size available
        actual: usize,
    },

    /// Length prefix outside the representable frame range
    #[error("frame length {length} out of range [{min}, {max}]")]
    LengthOutOfRange {
        /// Declared length
        length: u64,
        /// Minimum acceptable length
        min: u64,
        /// Maximum acceptable length
        max: u64,
    },

    /// Bytes consumed or written differ from the declared length
    #[error("frame length mismatch: declared {declared}, observed {observed}")]
    LengthMismatch {
        /// Length carried by the length prefix
        declared: usize,
        /// Length actually consumed or produced
        observed: usize,
    },

    /// A required header token is absent
    #[error("missing required header {name} (0x{id:04X})")]
    MissingRequiredToken {
        /// Token identifier
        id: u16,
        /// Token name
        name: &'static str,
    },

    /// A token's payload runs past the end of its header section
    #[error("truncated header 0x{id:04X}: need {needed} bytes, {available} available")]
    TruncatedToken {
        /// Token identifier
        id: u16,
        /// Bytes the payload requires
        needed: usize,
        /// Bytes left in the header section
        available: usize,
    },

    /// Token type tag not defined by the protocol
    #[error("invalid token type: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Wire type of a known token differs from its declared type
    #[error("header {name} (0x{id:04X}) declared {expected:?}, wire carries {actual:?}")]
    TokenTypeMismatch {
        /// Token identifier
        id: u16,
        /// Token name
        name: &'static str,
        /// Declared type
        expected: TokenType,
        /// Type tag found on the wire
        actual: TokenType,
    },

    /// String token payload is not valid UTF-8
    #[error("header 0x{id:04X} is not valid UTF-8")]
    InvalidUtf8 {
        /// Token identifier
        id: u16,
    },

    /// Operation type identifier not defined by the protocol
    #[error("unknown operation type: 0x{0:04X}")]
    UnknownOperationType(u32),

    /// Resource type identifier not defined by the protocol
    #[error("unknown resource type: 0x{0:04X}")]
    UnknownResourceType(u32),
}

/// Token value errors raised by [`Token::set_value`](crate::token::Token::set_value)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Value variant does not fit the token's declared type
    #[error("header {name} expects {expected:?}, got {actual}")]
    TypeMismatch {
        /// Token name
        name: &'static str,
        /// Declared type
        expected: TokenType,
        /// Name of the offered value variant
        actual: &'static str,
    },

    /// Value is longer than the token's length prefix can express
    #[error("header {name} value of {len} bytes exceeds {max}")]
    TooLong {
        /// Token name
        name: &'static str,
        /// Offered length
        len: usize,
        /// Largest encodable length
        max: usize,
    },
}
