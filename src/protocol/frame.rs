//! A decoded QTP frame: header plus payload.
//!
//! Payloads are `bytes::Bytes`, so handing a frame to several callbacks
//! shares one allocation.
//!
//! # Example
//!
//! ```
//! use qtp::protocol::{AckMode, Encoding, Frame, FrameConfig, Header};
//! use bytes::Bytes;
//!
//! let header = Header::new(42, FrameConfig::data(Encoding::Binary, AckMode::Sync), 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.sequence(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;

use super::wire_format::{AckMode, Encoding, Header, MessageKind, HEADER_SIZE};
use crate::error::{QtpError, Result};

/// One message as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    /// Exactly `header.payload_length` bytes.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload, without copying.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.header.encoding
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    #[inline]
    pub fn ack_mode(&self) -> AckMode {
        self.header.ack_mode
    }

    /// Whether this frame acknowledges an earlier DATA/RETRY frame.
    #[inline]
    pub fn is_ack(&self) -> bool {
        self.header.is_ack()
    }

    /// Whether this frame redelivers an earlier DATA frame.
    #[inline]
    pub fn is_retry(&self) -> bool {
        self.header.is_retry()
    }

    /// Deserialize a JSON-encoded payload.
    ///
    /// Fails with a protocol error if the frame is tagged BINARY.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.header.encoding != Encoding::Json {
            return Err(QtpError::Protocol(format!(
                "Frame {} carries a binary payload, not JSON",
                self.header.sequence
            )));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Serialize `header` followed by `payload`.
///
/// # Example
///
/// ```
/// use qtp::protocol::{build_frame, AckMode, Encoding, FrameConfig, Header, HEADER_SIZE};
///
/// let header = Header::new(1, FrameConfig::data(Encoding::Binary, AckMode::None), 4);
/// let bytes = build_frame(&header, b"ping");
/// assert_eq!(bytes.len(), HEADER_SIZE + 4);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameConfig, PROTOCOL_VERSION};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
        count: u32,
    }

    #[test]
    fn test_frame_accessors() {
        let header = Header::new(9, FrameConfig::data(Encoding::Json, AckMode::Async), 2);
        let frame = Frame::new(header, Bytes::from_static(b"{}"));

        assert_eq!(frame.sequence(), 9);
        assert_eq!(frame.encoding(), Encoding::Json);
        assert_eq!(frame.kind(), MessageKind::Data);
        assert_eq!(frame.ack_mode(), AckMode::Async);
        assert_eq!(frame.payload_len(), 2);
        assert!(!frame.is_ack());
        assert!(!frame.is_retry());
    }

    #[test]
    fn test_json_payload() {
        let value = Greeting {
            text: "hi".to_string(),
            count: 3,
        };
        let payload = serde_json::to_vec(&value).unwrap();
        let header = Header::new(
            1,
            FrameConfig::data(Encoding::Json, AckMode::None),
            payload.len() as u32,
        );
        let frame = Frame::new(header, Bytes::from(payload));

        assert_eq!(frame.json::<Greeting>().unwrap(), value);
    }

    #[test]
    fn test_json_rejects_binary_frame() {
        let header = Header::new(1, FrameConfig::data(Encoding::Binary, AckMode::None), 2);
        let frame = Frame::new(header, Bytes::from_static(b"{}"));

        assert!(frame.json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_payload_handle_shares_allocation() {
        let body = Bytes::from_static(b"shared body");
        let header = Header::new(4, FrameConfig::data(Encoding::Binary, AckMode::Async), 11);
        let frame = Frame::new(header, body.clone());

        assert_eq!(frame.payload_bytes().as_ptr(), body.as_ptr());
        assert_eq!(frame.clone().payload.as_ptr(), body.as_ptr());
    }

    #[test]
    fn test_serialized_frame_layout() {
        let header = Header::new(0x0102, FrameConfig::data(Encoding::Json, AckMode::Sync), 2);
        let bytes = build_frame(&header, b"[]");

        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(Header::decode(&bytes[..HEADER_SIZE], PROTOCOL_VERSION).unwrap(), header);
        assert_eq!(&bytes[HEADER_SIZE..], b"[]");
    }
}
