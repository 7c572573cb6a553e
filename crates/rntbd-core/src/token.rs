//! Self-describing header tokens.
//!
//! A token is one typed, optionally present header slot. On the wire a
//! present token is written as:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────────────────┐
//! │ id       │ type     │ payload                   │
//! │ u16 LE   │ u8       │ fixed or length-prefixed  │
//! └──────────┴──────────┴───────────────────────────┘
//! ```
//!
//! Decoded payloads are retained as a slice of the frame buffer and only
//! parsed into a [`TokenValue`] the first time the value is read.

use crate::error::{FrameError, TokenError};
use bytes::{BufMut, Bytes, BytesMut};
use std::cell::{Cell, OnceCell};
use std::fmt;
use uuid::Uuid;

/// Size of a token's identifier and type tag
pub const TOKEN_HEADER_SIZE: usize = 3;

/// Token payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Unsigned 8-bit integer
    Byte = 0x00,
    /// Unsigned 16-bit integer
    UShort = 0x01,
    /// Unsigned 32-bit integer
    ULong = 0x02,
    /// Signed 32-bit integer
    Long = 0x03,
    /// Unsigned 64-bit integer
    ULongLong = 0x04,
    /// Signed 64-bit integer
    LongLong = 0x05,
    /// 128-bit identifier in GUID layout
    Guid = 0x06,
    /// UTF-8 string with a 1-byte length prefix
    SmallString = 0x07,
    /// UTF-8 string with a 2-byte length prefix
    String = 0x08,
    /// UTF-8 string with a 4-byte length prefix
    ULongString = 0x09,
    /// Byte sequence with a 1-byte length prefix
    SmallBytes = 0x0A,
    /// Byte sequence with a 2-byte length prefix
    Bytes = 0x0B,
    /// Byte sequence with a 4-byte length prefix
    ULongBytes = 0x0C,
    /// 32-bit float
    Float = 0x0D,
    /// 64-bit float
    Double = 0x0E,
    /// Never valid on the wire
    Invalid = 0xFF,
}

impl TryFrom<u8> for TokenType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Byte),
            0x01 => Ok(Self::UShort),
            0x02 => Ok(Self::ULong),
            0x03 => Ok(Self::Long),
            0x04 => Ok(Self::ULongLong),
            0x05 => Ok(Self::LongLong),
            0x06 => Ok(Self::Guid),
            0x07 => Ok(Self::SmallString),
            0x08 => Ok(Self::String),
            0x09 => Ok(Self::ULongString),
            0x0A => Ok(Self::SmallBytes),
            0x0B => Ok(Self::Bytes),
            0x0C => Ok(Self::ULongBytes),
            0x0D => Ok(Self::Float),
            0x0E => Ok(Self::Double),
            _ => Err(FrameError::InvalidTokenType(value)),
        }
    }
}

impl TokenType {
    /// Payload size for fixed-width types
    #[must_use]
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Byte => Some(1),
            Self::UShort => Some(2),
            Self::ULong | Self::Long | Self::Float => Some(4),
            Self::ULongLong | Self::LongLong | Self::Double => Some(8),
            Self::Guid => Some(16),
            _ => None,
        }
    }

    /// Length-prefix size for variable-width types
    #[must_use]
    pub fn prefix_size(self) -> Option<usize> {
        match self {
            Self::SmallString | Self::SmallBytes => Some(1),
            Self::String | Self::Bytes => Some(2),
            Self::ULongString | Self::ULongBytes => Some(4),
            _ => None,
        }
    }

    fn max_len(self) -> usize {
        match self.prefix_size() {
            Some(1) => u8::MAX as usize,
            Some(2) => u16::MAX as usize,
            _ => u32::MAX as usize,
        }
    }

    /// Number of bytes the payload of a token of this type occupies at the
    /// front of `buf`, including any length prefix.
    pub fn payload_extent(self, id: u16, buf: &[u8]) -> Result<usize, FrameError> {
        let truncated = |needed: usize| FrameError::TruncatedToken {
            id,
            needed,
            available: buf.len(),
        };

        if let Some(size) = self.fixed_size() {
            return if buf.len() < size {
                Err(truncated(size))
            } else {
                Ok(size)
            };
        }

        let prefix = self
            .prefix_size()
            .ok_or(FrameError::InvalidTokenType(self as u8))?;
        if buf.len() < prefix {
            return Err(truncated(prefix));
        }

        let len = match prefix {
            1 => buf[0] as usize,
            2 => u16::from_le_bytes([buf[0], buf[1]]) as usize,
            _ => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
        };

        let needed = prefix + len;
        if buf.len() < needed {
            return Err(truncated(needed));
        }
        Ok(needed)
    }
}

/// Typed token value
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    /// [`TokenType::Byte`]
    Byte(u8),
    /// [`TokenType::UShort`]
    UShort(u16),
    /// [`TokenType::ULong`]
    ULong(u32),
    /// [`TokenType::Long`]
    Long(i32),
    /// [`TokenType::ULongLong`]
    ULongLong(u64),
    /// [`TokenType::LongLong`]
    LongLong(i64),
    /// [`TokenType::Guid`]
    Guid(Uuid),
    /// Any of the three string types
    String(String),
    /// Any of the three byte-sequence types
    Bytes(Bytes),
    /// [`TokenType::Float`]
    Float(f32),
    /// [`TokenType::Double`]
    Double(f64),
}

impl TokenValue {
    fn variant_name(&self) -> &'static str {
        match self {
            Self::Byte(_) => "Byte",
            Self::UShort(_) => "UShort",
            Self::ULong(_) => "ULong",
            Self::Long(_) => "Long",
            Self::ULongLong(_) => "ULongLong",
            Self::LongLong(_) => "LongLong",
            Self::Guid(_) => "Guid",
            Self::String(_) => "String",
            Self::Bytes(_) => "Bytes",
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
        }
    }

    fn fits(&self, token_type: TokenType) -> bool {
        use TokenType as T;
        matches!(
            (self, token_type),
            (Self::Byte(_), T::Byte)
                | (Self::UShort(_), T::UShort)
                | (Self::ULong(_), T::ULong)
                | (Self::Long(_), T::Long)
                | (Self::ULongLong(_), T::ULongLong)
                | (Self::LongLong(_), T::LongLong)
                | (Self::Guid(_), T::Guid)
                | (Self::String(_), T::SmallString | T::String | T::ULongString)
                | (Self::Bytes(_), T::SmallBytes | T::Bytes | T::ULongBytes)
                | (Self::Float(_), T::Float)
                | (Self::Double(_), T::Double)
        )
    }

    fn payload_len(&self, token_type: TokenType) -> usize {
        match self {
            Self::String(s) => token_type.prefix_size().unwrap_or(0) + s.len(),
            Self::Bytes(b) => token_type.prefix_size().unwrap_or(0) + b.len(),
            _ => token_type.fixed_size().unwrap_or(0),
        }
    }

    fn write_payload(&self, token_type: TokenType, out: &mut BytesMut) {
        match self {
            Self::Byte(v) => out.put_u8(*v),
            Self::UShort(v) => out.put_u16_le(*v),
            Self::ULong(v) => out.put_u32_le(*v),
            Self::Long(v) => out.put_i32_le(*v),
            Self::ULongLong(v) => out.put_u64_le(*v),
            Self::LongLong(v) => out.put_i64_le(*v),
            Self::Guid(v) => crate::guid::encode(v, out),
            Self::String(s) => {
                write_prefix(token_type, s.len(), out);
                out.put_slice(s.as_bytes());
            }
            Self::Bytes(b) => {
                write_prefix(token_type, b.len(), out);
                out.put_slice(b);
            }
            Self::Float(v) => out.put_f32_le(*v),
            Self::Double(v) => out.put_f64_le(*v),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_prefix(token_type: TokenType, len: usize, out: &mut BytesMut) {
    match token_type.prefix_size() {
        Some(1) => out.put_u8(len as u8),
        Some(2) => out.put_u16_le(len as u16),
        _ => out.put_u32_le(len as u32),
    }
}

impl fmt::Display for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(v) => write!(f, "{v}"),
            Self::UShort(v) => write!(f, "{v}"),
            Self::ULong(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::ULongLong(v) => write!(f, "{v}"),
            Self::LongLong(v) => write!(f, "{v}"),
            Self::Guid(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Bytes(v) => f.write_str(&hex::encode(v)),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for TokenValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value.into())
                }
            }
        )*
    };
}

impl_from_value! {
    u8 => Byte,
    u16 => UShort,
    u32 => ULong,
    i32 => Long,
    u64 => ULongLong,
    i64 => LongLong,
    Uuid => Guid,
    String => String,
    &str => String,
    Bytes => Bytes,
    Vec<u8> => Bytes,
    f32 => Float,
    f64 => Double,
}

impl From<bool> for TokenValue {
    fn from(value: bool) -> Self {
        Self::Byte(u8::from(value))
    }
}

fn fixed(raw: &[u8], id: u16, n: usize) -> Result<&[u8], FrameError> {
    raw.get(..n).ok_or(FrameError::TruncatedToken {
        id,
        needed: n,
        available: raw.len(),
    })
}

fn parse_payload(id: u16, token_type: TokenType, raw: &Bytes) -> Result<TokenValue, FrameError> {
    let fixed = |n: usize| fixed(raw, id, n);

    let value = match token_type {
        TokenType::Byte => TokenValue::Byte(fixed(1)?[0]),
        TokenType::UShort => {
            let b = fixed(2)?;
            TokenValue::UShort(u16::from_le_bytes([b[0], b[1]]))
        }
        TokenType::ULong => TokenValue::ULong(u32::from_le_bytes(array4(fixed(4)?))),
        TokenType::Long => TokenValue::Long(i32::from_le_bytes(array4(fixed(4)?))),
        TokenType::Float => TokenValue::Float(f32::from_le_bytes(array4(fixed(4)?))),
        TokenType::ULongLong => TokenValue::ULongLong(u64::from_le_bytes(array8(fixed(8)?))),
        TokenType::LongLong => TokenValue::LongLong(i64::from_le_bytes(array8(fixed(8)?))),
        TokenType::Double => TokenValue::Double(f64::from_le_bytes(array8(fixed(8)?))),
        TokenType::Guid => {
            let mut input = fixed(16)?;
            TokenValue::Guid(crate::guid::decode(&mut input)?)
        }
        TokenType::SmallString | TokenType::String | TokenType::ULongString => {
            let prefix = token_type.prefix_size().unwrap_or(0);
            let text = std::str::from_utf8(&raw[prefix.min(raw.len())..])
                .map_err(|_| FrameError::InvalidUtf8 { id })?;
            TokenValue::String(text.to_owned())
        }
        TokenType::SmallBytes | TokenType::Bytes | TokenType::ULongBytes => {
            let prefix = token_type.prefix_size().unwrap_or(0);
            TokenValue::Bytes(raw.slice(prefix.min(raw.len())..))
        }
        TokenType::Invalid => return Err(FrameError::InvalidTokenType(token_type as u8)),
    };

    Ok(value)
}

fn array4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn array8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// One typed, optionally present header slot
#[derive(Debug, Clone)]
pub struct Token {
    id: u16,
    name: &'static str,
    token_type: TokenType,
    required: bool,
    /// Wire payload retained from decode, including any length prefix
    raw: Option<Bytes>,
    /// Typed value, either set directly or parsed from `raw` on first read
    value: OnceCell<TokenValue>,
    encoded_len: Cell<Option<usize>>,
}

impl Token {
    /// Create an absent token
    #[must_use]
    pub const fn new(id: u16, name: &'static str, token_type: TokenType, required: bool) -> Self {
        Self {
            id,
            name,
            token_type,
            required,
            raw: None,
            value: OnceCell::new(),
            encoded_len: Cell::new(None),
        }
    }

    /// Create a placeholder for an identifier the schema does not declare
    #[must_use]
    pub const fn undefined(id: u16, token_type: TokenType) -> Self {
        Self::new(id, "Undefined", token_type, false)
    }

    /// Token identifier
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Token name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declared payload type
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// Whether the token must be present in a well-formed stream
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Whether a value has been set or decoded
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.raw.is_some() || self.value.get().is_some()
    }

    /// Set the token's value.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::TypeMismatch`] if the value does not match the
    /// declared type, or [`TokenError::TooLong`] if it cannot be length-prefixed.
    pub fn set_value(&mut self, value: impl Into<TokenValue>) -> Result<(), TokenError> {
        let value = value.into();

        if !value.fits(self.token_type) {
            return Err(TokenError::TypeMismatch {
                name: self.name,
                expected: self.token_type,
                actual: value.variant_name(),
            });
        }

        let len = match &value {
            TokenValue::String(s) => s.len(),
            TokenValue::Bytes(b) => b.len(),
            _ => 0,
        };
        let max = self.token_type.max_len();
        if len > max {
            return Err(TokenError::TooLong {
                name: self.name,
                len,
                max,
            });
        }

        self.raw = None;
        self.value = OnceCell::from(value);
        self.encoded_len.set(None);
        Ok(())
    }

    /// Mark the token absent
    pub fn clear(&mut self) {
        self.raw = None;
        self.value = OnceCell::new();
        self.encoded_len.set(None);
    }

    /// Read the token's value, parsing retained wire bytes on first access.
    pub fn value(&self) -> Result<Option<&TokenValue>, FrameError> {
        if let Some(value) = self.value.get() {
            return Ok(Some(value));
        }
        let Some(raw) = &self.raw else {
            return Ok(None);
        };
        let parsed = parse_payload(self.id, self.token_type, raw)?;
        Ok(Some(self.value.get_or_init(|| parsed)))
    }

    /// Integer value widened to `u32`
    pub fn as_u32(&self) -> Result<Option<u32>, FrameError> {
        Ok(match self.value()? {
            Some(TokenValue::Byte(v)) => Some(u32::from(*v)),
            Some(TokenValue::UShort(v)) => Some(u32::from(*v)),
            Some(TokenValue::ULong(v)) => Some(*v),
            _ => None,
        })
    }

    /// Integer value widened to `i64`
    pub fn as_i64(&self) -> Result<Option<i64>, FrameError> {
        Ok(match self.value()? {
            Some(TokenValue::Byte(v)) => Some(i64::from(*v)),
            Some(TokenValue::UShort(v)) => Some(i64::from(*v)),
            Some(TokenValue::ULong(v)) => Some(i64::from(*v)),
            Some(TokenValue::Long(v)) => Some(i64::from(*v)),
            Some(TokenValue::LongLong(v)) => Some(*v),
            Some(TokenValue::ULongLong(v)) => i64::try_from(*v).ok(),
            _ => None,
        })
    }

    /// Floating-point value widened to `f64`
    pub fn as_f64(&self) -> Result<Option<f64>, FrameError> {
        Ok(match self.value()? {
            Some(TokenValue::Float(v)) => Some(f64::from(*v)),
            Some(TokenValue::Double(v)) => Some(*v),
            _ => None,
        })
    }

    /// String value
    pub fn as_str(&self) -> Result<Option<&str>, FrameError> {
        Ok(match self.value()? {
            Some(TokenValue::String(v)) => Some(v.as_str()),
            _ => None,
        })
    }

    /// Byte-sequence value
    pub fn as_bytes(&self) -> Result<Option<&Bytes>, FrameError> {
        Ok(match self.value()? {
            Some(TokenValue::Bytes(v)) => Some(v),
            _ => None,
        })
    }

    /// Byte value interpreted as a flag
    pub fn as_bool(&self) -> Result<Option<bool>, FrameError> {
        Ok(match self.value()? {
            Some(TokenValue::Byte(v)) => Some(*v != 0),
            _ => None,
        })
    }

    fn payload_len(&self) -> usize {
        if let Some(raw) = &self.raw {
            raw.len()
        } else if let Some(value) = self.value.get() {
            value.payload_len(self.token_type)
        } else {
            0
        }
    }

    /// Encoded size in bytes; zero when absent
    #[must_use]
    pub fn compute_length(&self) -> usize {
        if !self.is_present() {
            return 0;
        }
        if let Some(len) = self.encoded_len.get() {
            return len;
        }
        let len = TOKEN_HEADER_SIZE + self.payload_len();
        self.encoded_len.set(Some(len));
        len
    }

    /// Write the token; absent optional tokens write nothing.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MissingRequiredToken`] if the token is required
    /// and absent.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        if !self.is_present() {
            return if self.required {
                Err(FrameError::MissingRequiredToken {
                    id: self.id,
                    name: self.name,
                })
            } else {
                Ok(())
            };
        }

        out.reserve(self.compute_length());
        out.put_u16_le(self.id);
        out.put_u8(self.token_type as u8);

        if let Some(raw) = &self.raw {
            out.put_slice(raw);
        } else if let Some(value) = self.value.get() {
            value.write_payload(self.token_type, out);
        }
        Ok(())
    }

    /// Read this token's payload from the front of `buf`.
    ///
    /// The identifier and type tag must already have been consumed. The
    /// payload is retained as a slice of `buf` without copying.
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<(), FrameError> {
        let extent = self.token_type.payload_extent(self.id, buf)?;
        self.raw = Some(buf.split_to(extent));
        self.value = OnceCell::new();
        self.encoded_len.set(None);
        Ok(())
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.token_type == other.token_type
            && matches!((self.value(), other.value()), (Ok(a), Ok(b)) if a == b)
    }
}
