//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol:
//! - 23-byte header encoding/decoding
//! - Encoder assigning sequence numbers
//! - Parser for buffers and byte streams
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod encoder;
mod frame;
mod frame_buffer;
mod parser;
mod wire_format;

pub use encoder::Encoder;
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use parser::Parser;
pub use wire_format::{
    offsets, AckMode, Encoding, FrameConfig, Header, MessageKind, DEFAULT_MAX_PAYLOAD_SIZE,
    HEADER_SIZE, MAGIC, PROTOCOL_VERSION,
};
