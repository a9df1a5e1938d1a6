//! Wire format encoding and decoding.
//!
//! Implements the 23-byte header format:
//! ```text
//! ┌────────┬─────────┬──────────┬──────────┬──────┬─────────┬──────────┬──────────┐
//! │ Magic  │ Version │ Sequence │ Encoding │ Kind │ AckMode │ Length   │ Reserved │
//! │ 5 bytes│ 1 byte  │ 8 bytes  │ 1 byte   │1 byte│ 1 byte  │ 4 bytes  │ 2 bytes  │
//! │        │         │ u64 LE   │          │      │         │ u32 LE   │ u16 LE   │
//! └────────┴─────────┴──────────┴──────────┴──────┴─────────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use crate::error::{QtpError, Result};

/// Header size in bytes (fixed, exactly 23).
pub const HEADER_SIZE: usize = 23;

/// Magic flag opening every frame.
pub const MAGIC: [u8; 5] = [0x78, 0x51, 0x6d, 0x73, 0x67];

/// Protocol version written by the default encoder and expected by the default parser.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum payload size (the full range of the length field).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = u32::MAX;

/// Byte offsets of the header fields.
pub mod offsets {
    pub const VERSION: usize = 5;
    pub const SEQUENCE: usize = 6;
    pub const ENCODING: usize = 14;
    pub const KIND: usize = 15;
    pub const ACK_MODE: usize = 16;
    pub const LENGTH: usize = 17;
    pub const RESERVED: usize = 21;
}

/// How the payload bytes are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    Json = 0,
    Binary = 1,
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Acknowledgment of a previously received frame.
    Ack = 0,
    /// Application data.
    Data = 1,
    /// Redelivery of a DATA frame whose acknowledgment timed out.
    Retry = 2,
}

/// Delivery guarantee requested for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckMode {
    /// Fire-and-forget.
    None = 0,
    /// Receiver finishes its callbacks before acknowledging; sender serializes.
    Sync = 1,
    /// Receiver acknowledges after its callbacks, without blocking its loop.
    Async = 2,
}

impl TryFrom<u8> for Encoding {
    type Error = QtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Encoding::Json),
            1 => Ok(Encoding::Binary),
            other => Err(QtpError::Protocol(format!(
                "Unknown payload encoding tag {}",
                other
            ))),
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = QtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Ack),
            1 => Ok(MessageKind::Data),
            2 => Ok(MessageKind::Retry),
            other => Err(QtpError::Protocol(format!(
                "Unknown message kind {}",
                other
            ))),
        }
    }
}

impl TryFrom<u8> for AckMode {
    type Error = QtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AckMode::None),
            1 => Ok(AckMode::Sync),
            2 => Ok(AckMode::Async),
            other => Err(QtpError::Protocol(format!("Unknown ack mode {}", other))),
        }
    }
}

/// Per-frame settings chosen by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub encoding: Encoding,
    pub kind: MessageKind,
    pub ack_mode: AckMode,
}

impl FrameConfig {
    /// DATA frame with the given encoding and ack mode.
    pub fn data(encoding: Encoding, ack_mode: AckMode) -> Self {
        Self {
            encoding,
            kind: MessageKind::Data,
            ack_mode,
        }
    }

    /// ACK frame: always BINARY and never itself acknowledged.
    pub fn ack() -> Self {
        Self {
            encoding: Encoding::Binary,
            kind: MessageKind::Ack,
            ack_mode: AckMode::None,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,
    /// Sequence number correlating a frame with its acknowledgment.
    pub sequence: u64,
    /// Payload encoding.
    pub encoding: Encoding,
    /// Message kind.
    pub kind: MessageKind,
    /// Acknowledgment mode.
    pub ack_mode: AckMode,
    /// Payload length in bytes.
    pub payload_length: u32,
    /// Reserved, zero on encode.
    pub reserved: u16,
}

impl Header {
    /// Create a new header for the current protocol version.
    pub fn new(sequence: u64, config: FrameConfig, payload_length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            encoding: config.encoding,
            kind: config.kind,
            ack_mode: config.ack_mode,
            payload_length,
            reserved: 0,
        }
    }

    /// Frame settings carried by this header.
    pub fn config(&self) -> FrameConfig {
        FrameConfig {
            encoding: self.encoding,
            kind: self.kind,
            ack_mode: self.ack_mode,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use qtp::protocol::{FrameConfig, Header, Encoding, AckMode, MAGIC};
    ///
    /// let header = Header::new(42, FrameConfig::data(Encoding::Binary, AckMode::None), 4);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 23);
    /// assert_eq!(&bytes[..5], &MAGIC);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (23 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[..offsets::VERSION].copy_from_slice(&MAGIC);
        buf[offsets::VERSION] = self.version;
        buf[offsets::SEQUENCE..offsets::ENCODING].copy_from_slice(&self.sequence.to_le_bytes());
        buf[offsets::ENCODING] = self.encoding as u8;
        buf[offsets::KIND] = self.kind as u8;
        buf[offsets::ACK_MODE] = self.ack_mode as u8;
        buf[offsets::LENGTH..offsets::RESERVED].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[offsets::RESERVED..HEADER_SIZE].copy_from_slice(&self.reserved.to_le_bytes());
    }

    /// Decode header from bytes, expecting the given protocol version.
    ///
    /// Every failure is reported; nothing is coerced.
    pub fn decode(buf: &[u8], version: u8) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(QtpError::Truncated {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        if buf[..offsets::VERSION] != MAGIC {
            return Err(QtpError::Protocol(
                "Magic flag mismatch, not a QTP frame".to_string(),
            ));
        }

        if buf[offsets::VERSION] != version {
            return Err(QtpError::Protocol(format!(
                "Protocol version {} does not match parser version {}",
                buf[offsets::VERSION],
                version
            )));
        }

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&buf[offsets::SEQUENCE..offsets::ENCODING]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&buf[offsets::LENGTH..offsets::RESERVED]);

        Ok(Self {
            version,
            sequence: u64::from_le_bytes(sequence),
            encoding: Encoding::try_from(buf[offsets::ENCODING])?,
            kind: MessageKind::try_from(buf[offsets::KIND])?,
            ack_mode: AckMode::try_from(buf[offsets::ACK_MODE])?,
            payload_length: u32::from_le_bytes(length),
            reserved: u16::from_le_bytes([buf[offsets::RESERVED], buf[offsets::RESERVED + 1]]),
        })
    }

    /// Check if this is an acknowledgment.
    #[inline]
    pub fn is_ack(&self) -> bool {
        self.kind == MessageKind::Ack
    }

    /// Check if this is a redelivery.
    #[inline]
    pub fn is_retry(&self) -> bool {
        self.kind == MessageKind::Retry
    }
}
