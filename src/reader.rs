//! Reader task: parses inbound frames and routes them by kind.
//!
//! ```text
//!                         ┌─► data queue (DATA, RETRY) ─► Receiver
//! Transport ─► FrameBuffer┤
//!                         ├─► ack queue (ACK) ─────────► Sender ack matcher
//!                         └─► failure (oneshot) ───────► Receiver shutdown
//! ```
//!
//! The task ends on the first framing error, I/O error or end of stream,
//! reporting it once on the failure channel. A partial frame left over from
//! a link that was replaced by a reconnect is discarded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{QtpError, Result};
use crate::protocol::{Frame, FrameBuffer, MessageKind, Parser, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::Transport;

/// Default data queue capacity.
pub const DEFAULT_DATA_CAPACITY: usize = 1000;

/// Default ack queue capacity.
pub const DEFAULT_ACK_CAPACITY: usize = 1000;

/// Default size of a single read from the transport.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Capacity of the DATA/RETRY queue. A full queue stalls the reader.
    pub data_capacity: usize,
    /// Capacity of the ACK queue.
    pub ack_capacity: usize,
    /// Bytes requested per read.
    pub read_buffer_size: usize,
    /// Largest payload accepted from the wire.
    pub max_payload: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            data_capacity: DEFAULT_DATA_CAPACITY,
            ack_capacity: DEFAULT_ACK_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Output side of a reader task.
#[derive(Debug)]
pub struct Inbound {
    /// DATA and RETRY frames.
    pub data: mpsc::Receiver<Frame>,
    /// ACK frames.
    pub acks: mpsc::Receiver<Frame>,
    /// Terminal error, sent once when the reader stops.
    pub failure: oneshot::Receiver<QtpError>,
}

/// Spawn the reader task.
///
/// The parser's payload cap is tightened to `config.max_payload`.
pub fn spawn_reader(
    transport: Arc<dyn Transport>,
    parser: Parser,
    config: ReaderConfig,
) -> (Inbound, JoinHandle<()>) {
    let (data_tx, data) = mpsc::channel(config.data_capacity.max(1));
    let (ack_tx, acks) = mpsc::channel(config.ack_capacity.max(1));
    let (failure_tx, failure) = oneshot::channel();

    let parser = parser.with_max_payload(parser.max_payload().min(config.max_payload));
    let task = tokio::spawn(async move {
        let error = read_loop(transport, parser, config.read_buffer_size, data_tx, ack_tx).await;
        if error.is_framing() {
            tracing::error!("Reader stopped on malformed input: {}", error);
        } else {
            tracing::debug!("Reader stopped: {}", error);
        }
        let _ = failure_tx.send(error);
    });

    (Inbound { data, acks, failure }, task)
}

/// Read and route frames until something goes wrong; returns what went wrong.
async fn read_loop(
    transport: Arc<dyn Transport>,
    parser: Parser,
    read_buffer_size: usize,
    data_tx: mpsc::Sender<Frame>,
    ack_tx: mpsc::Sender<Frame>,
) -> QtpError {
    let mut buffer = FrameBuffer::new(parser);
    let mut chunk = vec![0u8; read_buffer_size.max(1)];
    let mut link = transport.read_generation();

    loop {
        let n = match transport.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) => return e,
        };
        if n == 0 {
            return end_of_stream(&buffer);
        }

        let generation = transport.read_generation();
        if generation != link {
            if buffer.has_partial() {
                tracing::debug!(
                    generation,
                    dropped = buffer.partial_len(),
                    "Discarding partial frame from previous link"
                );
            }
            buffer.clear();
            link = generation;
        }
        buffer.extend(&chunk[..n]);

        loop {
            let frame = match buffer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return e,
            };
            if let Err(e) = route(frame, &data_tx, &ack_tx).await {
                return e;
            }
        }
    }
}

async fn route(
    frame: Frame,
    data_tx: &mpsc::Sender<Frame>,
    ack_tx: &mpsc::Sender<Frame>,
) -> Result<()> {
    let seq = frame.sequence();
    let queue = match frame.kind() {
        MessageKind::Ack => ack_tx,
        MessageKind::Data | MessageKind::Retry => data_tx,
    };
    tracing::debug!(seq, kind = ?frame.kind(), "Frame received");
    queue
        .send(frame)
        .await
        .map_err(|_| QtpError::ConnectionClosed.context("inbound queue dropped"))
}

fn end_of_stream(buffer: &FrameBuffer) -> QtpError {
    if buffer.has_partial() {
        QtpError::Truncated {
            expected: buffer.expected_len(),
            actual: buffer.partial_len(),
        }
    } else {
        QtpError::ConnectionClosed
    }
}
