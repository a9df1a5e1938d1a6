//! Error types for qtp.

use thiserror::Error;

/// Main error type for all qtp operations.
#[derive(Debug, Error)]
pub enum QtpError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (JSON-encoded payloads).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation (wrong magic flag, wrong version, unknown enum tag).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The stream ended before a complete frame was read.
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Payload does not fit the 32-bit length field.
    #[error("Payload of {0} bytes exceeds the 32-bit length field")]
    PayloadTooLarge(usize),

    /// Connection closed locally or permanently lost.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every dial attempt of a reconnect round failed.
    #[error("Reconnect failed after {attempts} attempts: {reason}")]
    ReconnectExhausted { attempts: usize, reason: String },

    /// No acknowledgment arrived for a SYNC/ASYNC frame.
    #[error("No acknowledgment for frame {seq} after {attempts} retries")]
    DeliveryFailed { seq: u64, attempts: usize },

    /// The writer pipeline no longer accepts requests.
    #[error("Writer closed")]
    WriterClosed,

    /// The sender no longer accepts submissions.
    #[error("Sender closed")]
    SenderClosed,

    /// An error with additional context attached.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<QtpError>,
    },
}

impl QtpError {
    /// Wrap this error with a context message, keeping it as the source.
    pub fn context(self, context: impl Into<String>) -> Self {
        QtpError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error means the byte stream can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        match self {
            QtpError::Protocol(_) | QtpError::Truncated { .. } => true,
            QtpError::Context { source, .. } => source.is_framing(),
            _ => false,
        }
    }
}

/// Result type alias using QtpError.
pub type Result<T> = std::result::Result<T, QtpError>;
