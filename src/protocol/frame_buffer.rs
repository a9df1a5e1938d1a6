//! Streaming reassembly of frames from arbitrary read chunks.
//!
//! Reads from a socket split and merge frames at any byte. `FrameBuffer`
//! keeps the unconsumed bytes in a `BytesMut` and alternates between two
//! phases:
//!
//! ```text
//! AwaitHeader ──(23 bytes, header valid)──► AwaitPayload ──(length bytes)──► frame
//!      ▲                                                                       │
//!      └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Header validation runs through a [`Parser`], so a bad magic flag or
//! version is reported as soon as the 23 header bytes are buffered, without
//! waiting for the payload.
//!
//! # Example
//!
//! ```ignore
//! use qtp::protocol::{FrameBuffer, Parser};
//!
//! let mut frames = FrameBuffer::new(Parser::new());
//! frames.extend(&chunk);
//! while let Some(frame) = frames.next_frame()? {
//!     route(frame);
//! }
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE};
use super::{Frame, Parser};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
enum Phase {
    AwaitHeader,
    /// Header consumed; its payload is still arriving.
    AwaitPayload(Header),
}

/// Accumulates stream bytes and cuts them into frames.
pub struct FrameBuffer {
    pending: BytesMut,
    phase: Phase,
    parser: Parser,
}

impl FrameBuffer {
    /// Buffer with a 64KB initial capacity.
    pub fn new(parser: Parser) -> Self {
        Self::with_capacity(parser, 64 * 1024)
    }

    pub fn with_capacity(parser: Parser, capacity: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(capacity),
            phase: Phase::AwaitHeader,
            parser,
        }
    }

    /// Append `data` and return every frame it completes.
    ///
    /// Leftover bytes stay buffered for the next call. On a header
    /// validation error the buffered stream cannot be resynchronized.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut complete = Vec::new();
        while let Some(frame) = self.next_frame()? {
            complete.push(frame);
        }
        Ok(complete)
    }

    /// Append `data` without cutting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Cut the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Phase::AwaitHeader = self.phase {
            if self.pending.len() < HEADER_SIZE {
                return Ok(None);
            }
            let header = self.parser.parse_header(&self.pending[..HEADER_SIZE])?;
            self.pending.advance(HEADER_SIZE);
            if header.payload_length == 0 {
                return Ok(Some(Frame::new(header, Bytes::new())));
            }
            self.phase = Phase::AwaitPayload(header);
        }

        let Phase::AwaitPayload(header) = self.phase else {
            return Ok(None);
        };
        let needed = header.payload_length as usize;
        if self.pending.len() < needed {
            return Ok(None);
        }

        let payload = self.pending.split_to(needed).freeze();
        self.phase = Phase::AwaitHeader;
        Ok(Some(Frame::new(header, payload)))
    }

    /// Buffered bytes not yet consumed as a header or payload.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a frame has been started but not completed.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty() || matches!(self.phase, Phase::AwaitPayload(_))
    }

    /// Bytes received toward the frame in progress, header included.
    pub fn partial_len(&self) -> usize {
        match self.phase {
            Phase::AwaitHeader => self.pending.len(),
            Phase::AwaitPayload(_) => HEADER_SIZE + self.pending.len(),
        }
    }

    /// Full length of the frame in progress, as far as it is known.
    pub fn expected_len(&self) -> usize {
        match self.phase {
            Phase::AwaitHeader => HEADER_SIZE,
            Phase::AwaitPayload(header) => HEADER_SIZE + header.payload_length as usize,
        }
    }

    /// Drop buffered bytes and any frame in progress.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.phase = Phase::AwaitHeader;
    }

    #[cfg(test)]
    fn awaiting_payload(&self) -> bool {
        matches!(self.phase, Phase::AwaitPayload(_))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(Parser::new())
    }
}
