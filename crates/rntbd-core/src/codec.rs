//! Inbound stream decoder.

use crate::MAX_FRAME_LENGTH;
use crate::context::ContextResponse;
use crate::error::FrameError;
use crate::response::Response;
use bytes::BytesMut;

/// A complete frame read from a connection
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// The first frame on a connection
    Context(ContextResponse),
    /// Any frame after the first
    Response(Response),
}

/// Splits an inbound byte stream into frames.
///
/// Context and data responses share a status frame layout, so the decoder
/// tells them apart by position: the first frame is the context response.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_length: u32,
    context_seen: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder accepting frames up to the protocol maximum
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    /// Decoder with a tighter frame length limit
    #[must_use]
    pub fn with_max_frame_length(max_frame_length: u32) -> Self {
        Self {
            max_frame_length: max_frame_length.min(MAX_FRAME_LENGTH),
            context_seen: false,
        }
    }

    /// Whether the context response has been decoded
    #[must_use]
    pub fn context_seen(&self) -> bool {
        self.context_seen
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed; `buf` is untouched. Any error
    /// leaves the stream unrecoverable.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<InboundFrame>, FrameError> {
        if !self.context_seen {
            let Some(context) = ContextResponse::decode_with_limit(buf, self.max_frame_length)? else {
                return Ok(None);
            };
            self.context_seen = true;
            return Ok(Some(InboundFrame::Context(context)));
        }

        Ok(Response::decode_with_limit(buf, self.max_frame_length)?.map(InboundFrame::Response))
    }
}
