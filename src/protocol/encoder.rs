//! Frame encoding.

use std::sync::Arc;

use super::frame::build_frame;
use super::wire_format::{FrameConfig, Header, PROTOCOL_VERSION};
use crate::error::{QtpError, Result};
use crate::sequence::SequenceGenerator;

/// Wraps payloads into frames, drawing sequence numbers from a generator.
#[derive(Clone)]
pub struct Encoder {
    sequences: Arc<dyn SequenceGenerator>,
    version: u8,
}

impl Encoder {
    /// Encoder for the current protocol version.
    pub fn new(sequences: Arc<dyn SequenceGenerator>) -> Self {
        Self {
            sequences,
            version: PROTOCOL_VERSION,
        }
    }

    /// Write a different protocol version byte.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Encode `payload` under a freshly generated sequence number.
    ///
    /// No sequence number is consumed when the payload is too large.
    pub fn encode(&self, payload: &[u8], config: FrameConfig) -> Result<(u64, Vec<u8>)> {
        let length = payload_length(payload)?;
        let sequence = self.sequences.next_seq();
        Ok((sequence, self.build(sequence, length, payload, config)))
    }

    /// Encode `payload` under a caller-chosen sequence number.
    ///
    /// Used for ACK frames, which echo the sequence of the frame they acknowledge.
    pub fn encode_with_sequence(
        &self,
        sequence: u64,
        payload: &[u8],
        config: FrameConfig,
    ) -> Result<Vec<u8>> {
        let length = payload_length(payload)?;
        Ok(self.build(sequence, length, payload, config))
    }

    fn build(&self, sequence: u64, length: u32, payload: &[u8], config: FrameConfig) -> Vec<u8> {
        let mut header = Header::new(sequence, config, length);
        header.version = self.version;
        build_frame(&header, payload)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn payload_length(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len()).map_err(|_| QtpError::PayloadTooLarge(payload.len()))
}
