//! Token streams: the header section of every message.

use crate::error::{FrameError, TokenError};
use crate::headers::Header;
use crate::token::{TOKEN_HEADER_SIZE, Token, TokenType, TokenValue};
use bytes::{Buf, Bytes, BytesMut};
use std::marker::PhantomData;

/// Ordered collection of the tokens declared by schema `H`
///
/// Identifiers the schema does not know are kept as undefined tokens so a
/// peer adding headers does not break decoding; they are written back after
/// the declared tokens on encode.
#[derive(Debug, Clone)]
pub struct TokenStream<H: Header> {
    tokens: Vec<Token>,
    undefined: Vec<Token>,
    _schema: PhantomData<H>,
}

impl<H: Header> Default for TokenStream<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Header> TokenStream<H> {
    /// Create a stream with every declared token absent
    #[must_use]
    pub fn new() -> Self {
        let tokens = H::ALL
            .iter()
            .map(|h| Token::new(h.id(), h.name(), h.token_type(), h.is_required()))
            .collect();

        Self {
            tokens,
            undefined: Vec::new(),
            _schema: PhantomData,
        }
    }

    /// Declared token
    #[must_use]
    pub fn get(&self, header: H) -> &Token {
        &self.tokens[header.index()]
    }

    /// Declared token, mutably
    pub fn get_mut(&mut self, header: H) -> &mut Token {
        &mut self.tokens[header.index()]
    }

    /// Set a declared token's value
    pub fn set(&mut self, header: H, value: impl Into<TokenValue>) -> Result<&mut Self, TokenError> {
        self.get_mut(header).set_value(value)?;
        Ok(self)
    }

    /// Whether a declared token is present
    #[must_use]
    pub fn contains(&self, header: H) -> bool {
        self.get(header).is_present()
    }

    /// Present tokens, declared ones first in declaration order
    pub fn present(&self) -> impl Iterator<Item = &Token> {
        self.tokens
            .iter()
            .chain(self.undefined.iter())
            .filter(|t| t.is_present())
    }

    /// Tokens with identifiers the schema does not declare
    #[must_use]
    pub fn undefined(&self) -> &[Token] {
        &self.undefined
    }

    /// Encoded size of all present tokens
    #[must_use]
    pub fn compute_length(&self) -> usize {
        self.present().map(Token::compute_length).sum()
    }

    /// Number of present tokens
    #[must_use]
    pub fn compute_count(&self) -> usize {
        self.present().count()
    }

    /// Write all present tokens.
    ///
    /// # Errors
    ///
    /// Fails with [`FrameError::MissingRequiredToken`] if a required token is
    /// absent; nothing useful should be sent in that case.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), FrameError> {
        out.reserve(self.compute_length());
        for token in self.tokens.iter().chain(self.undefined.iter()) {
            token.encode(out)?;
        }
        Ok(())
    }

    /// Decode a complete header section.
    ///
    /// `buf` must hold exactly the header bytes; decoding stops when it is
    /// exhausted. Payloads stay as slices of `buf`.
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        let mut stream = Self::new();

        while buf.has_remaining() {
            if buf.remaining() < TOKEN_HEADER_SIZE {
                return Err(FrameError::TooShort {
                    expected: TOKEN_HEADER_SIZE,
                    actual: buf.remaining(),
                });
            }

            let id = buf.get_u16_le();
            let token_type = TokenType::try_from(buf.get_u8())?;

            match H::from_id(id) {
                Some(header) => {
                    let token = &mut stream.tokens[header.index()];
                    if token.token_type() != token_type {
                        return Err(FrameError::TokenTypeMismatch {
                            id,
                            name: token.name(),
                            expected: token.token_type(),
                            actual: token_type,
                        });
                    }
                    token.decode(&mut buf)?;
                }
                None => {
                    let mut token = Token::undefined(id, token_type);
                    token.decode(&mut buf)?;
                    tracing::trace!(
                        "Preserving undefined header 0x{:04X} ({:?}, {} bytes)",
                        id,
                        token_type,
                        token.compute_length()
                    );
                    stream.undefined.push(token);
                }
            }
        }

        if let Some(missing) = stream
            .tokens
            .iter()
            .find(|t| t.is_required() && !t.is_present())
        {
            return Err(FrameError::MissingRequiredToken {
                id: missing.id(),
                name: missing.name(),
            });
        }

        Ok(stream)
    }

    /// Locate the raw payload of `header` in an encoded header section
    /// without materializing the stream.
    ///
    /// Returns the payload bytes of the last occurrence, or `None` if the
    /// token is absent.
    pub fn peek(mut buf: &[u8], header: H) -> Result<Option<&[u8]>, FrameError> {
        let mut found = None;

        while !buf.is_empty() {
            if buf.len() < TOKEN_HEADER_SIZE {
                return Err(FrameError::TooShort {
                    expected: TOKEN_HEADER_SIZE,
                    actual: buf.len(),
                });
            }

            let id = u16::from_le_bytes([buf[0], buf[1]]);
            let token_type = TokenType::try_from(buf[2])?;
            let rest = &buf[TOKEN_HEADER_SIZE..];
            let extent = token_type.payload_extent(id, rest)?;

            if id == header.id() {
                if token_type != header.token_type() {
                    return Err(FrameError::TokenTypeMismatch {
                        id,
                        name: header.name(),
                        expected: header.token_type(),
                        actual: token_type,
                    });
                }
                found = Some(&rest[..extent]);
            }
            buf = &rest[extent..];
        }

        Ok(found)
    }
}

impl<H: Header> PartialEq for TokenStream<H> {
    fn eq(&self, other: &Self) -> bool {
        self.tokens == other.tokens && self.undefined == other.undefined
    }
}
