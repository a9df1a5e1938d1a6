//! Frame parsing from buffers and byte streams.
//!
//! A [`Parser`] is stateless apart from the protocol version and payload cap
//! it was configured with, so it is `Copy` and can be handed to every reader.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAGIC, PROTOCOL_VERSION};
use super::Frame;
use crate::error::{QtpError, Result};

/// Validates headers against a protocol version and payload cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parser {
    version: u8,
    max_payload: u32,
}

impl Parser {
    /// Parser for the current protocol version accepting the full length range.
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Expect a different protocol version byte.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Reject frames declaring a payload longer than `limit`.
    pub fn with_max_payload(mut self, limit: u32) -> Self {
        self.max_payload = limit;
        self
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Parse and validate the first 23 bytes of `buf`.
    pub fn parse_header(&self, buf: &[u8]) -> Result<Header> {
        let header = Header::decode(buf, self.version)?;
        if header.payload_length > self.max_payload {
            return Err(QtpError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                header.payload_length, self.max_payload
            )));
        }
        Ok(header)
    }

    /// Split a buffer into frames by scanning for the magic flag.
    ///
    /// One result per discovered frame start. A frame whose header parses is
    /// delimited by its declared length, so magic bytes inside its payload are
    /// never mistaken for a boundary. A header that fails validation yields an
    /// `Err` and scanning resumes after its magic flag. A frame cut short by the
    /// end of the buffer yields `Truncated` and ends the scan.
    pub fn parse_buffer(&self, buf: &[u8]) -> Vec<Result<Frame>> {
        let mut results = Vec::new();
        let mut pos = 0;

        while let Some(offset) = find_magic(&buf[pos..]) {
            let start = pos + offset;
            match self.parse_header(&buf[start..]) {
                Ok(header) => {
                    let frame_len = HEADER_SIZE + header.payload_length as usize;
                    let available = buf.len() - start;
                    if available < frame_len {
                        results.push(Err(QtpError::Truncated {
                            expected: frame_len,
                            actual: available,
                        }));
                        break;
                    }
                    let payload = Bytes::copy_from_slice(&buf[start + HEADER_SIZE..start + frame_len]);
                    results.push(Ok(Frame::new(header, payload)));
                    pos = start + frame_len;
                }
                Err(e) => {
                    results.push(Err(e));
                    pos = start + MAGIC.len();
                }
            }
        }

        results
    }

    /// Read exactly one frame from `reader`.
    ///
    /// Any error leaves the stream at an unknown position; the caller must
    /// treat the connection as compromised.
    pub async fn parse_stream<R>(&self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = read_full(reader, &mut header_buf).await?;
        if read < HEADER_SIZE {
            return Err(QtpError::Truncated {
                expected: HEADER_SIZE,
                actual: read,
            });
        }

        let header = self.parse_header(&header_buf)?;
        if header.payload_length == 0 {
            return Ok(Frame::new(header, Bytes::new()));
        }

        let expected = header.payload_length as usize;
        let mut payload = vec![0u8; expected];
        let read = read_full(reader, &mut payload).await?;
        if read < expected {
            return Err(QtpError::Truncated {
                expected,
                actual: read,
            });
        }

        Ok(Frame::new(header, Bytes::from(payload)))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the first magic flag in `buf`.
fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|window| window == MAGIC)
}

/// Fill `buf` until it is full or the stream ends, returning the byte count.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
