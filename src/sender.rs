//! Application-facing send side of a connection.
//!
//! # Architecture
//!
//! ```text
//! send_*() ─► submit queue ─► Forward Task ─► WriterHandle ─► Writer Task
//!                             (encode, seq,        ▲
//!                              SYNC ordering)      │ finish(seq)
//! ack queue (from Reader) ─────► Ack Matcher ──────┘
//! ```
//!
//! The forward task encodes each submission, assigning its sequence number,
//! and hands it to the writer. A SYNC submission holds the forward task until
//! its completion has run, so SYNC sends of one `Sender` go out one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{QtpError, Result};
use crate::protocol::{AckMode, Encoder, Encoding, Frame, FrameConfig};
use crate::task_group::TaskGroup;
use crate::transport::Transport;
use crate::writer::{Completion, SendRequest, WriterHandle};

/// Default submit queue capacity.
pub const DEFAULT_SUBMIT_CAPACITY: usize = 1000;

/// Configuration for a [`Sender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Capacity of the submit queue. A full queue makes `send_*` wait.
    pub submit_capacity: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            submit_capacity: DEFAULT_SUBMIT_CAPACITY,
        }
    }
}

/// A payload waiting to be encoded.
struct Submission {
    payload: Bytes,
    config: FrameConfig,
    completion: Completion,
}

struct Inner {
    submit_tx: mpsc::Sender<Submission>,
    accepting: AtomicBool,
    stop_forward: Arc<Notify>,
    stop_acks: Arc<Notify>,
    forward: TaskGroup,
    ack_matcher: TaskGroup,
    writer: WriterHandle,
    transport: Arc<dyn Transport>,
}

/// Sends payloads over one connection.
///
/// This is cheaply cloneable; every clone feeds the same queue. Callbacks
/// passed to `send_*` run exactly once with the frame's sequence number and
/// the delivery outcome.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Inner>,
}

impl Sender {
    /// Start the forward task and the ack matcher.
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        writer: WriterHandle,
        acks: mpsc::Receiver<Frame>,
        encoder: Encoder,
        config: SenderConfig,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(config.submit_capacity.max(1));
        let inner = Arc::new(Inner {
            submit_tx,
            accepting: AtomicBool::new(true),
            stop_forward: Arc::new(Notify::new()),
            stop_acks: Arc::new(Notify::new()),
            forward: TaskGroup::new("forward"),
            ack_matcher: TaskGroup::new("ack-matcher"),
            writer: writer.clone(),
            transport,
        });

        inner.forward.spawn(forward_loop(
            submit_rx,
            encoder,
            writer.clone(),
            Arc::clone(&inner.stop_forward),
        ));
        inner
            .ack_matcher
            .spawn(ack_loop(acks, writer, Arc::clone(&inner.stop_acks)));

        Self { inner }
    }

    /// Send without acknowledgment. The callback reports the write result.
    pub async fn send_no_ack<F>(&self, payload: impl Into<Bytes>, encoding: Encoding, callback: F)
    where
        F: FnOnce(u64, Result<()>) + Send + 'static,
    {
        self.send(payload.into(), FrameConfig::data(encoding, AckMode::None), callback)
            .await
    }

    /// Send and wait for an acknowledgment before sending the next SYNC frame.
    pub async fn send_sync_ack<F>(&self, payload: impl Into<Bytes>, encoding: Encoding, callback: F)
    where
        F: FnOnce(u64, Result<()>) + Send + 'static,
    {
        self.send(payload.into(), FrameConfig::data(encoding, AckMode::Sync), callback)
            .await
    }

    /// Send and track the acknowledgment without holding back later sends.
    pub async fn send_async_ack<F>(
        &self,
        payload: impl Into<Bytes>,
        encoding: Encoding,
        callback: F,
    ) where
        F: FnOnce(u64, Result<()>) + Send + 'static,
    {
        self.send(payload.into(), FrameConfig::data(encoding, AckMode::Async), callback)
            .await
    }

    /// Serialize `value` as JSON and send it with the given ack mode.
    ///
    /// A value that fails to serialize is reported to the callback with
    /// sequence 0.
    pub async fn send_json<T, F>(&self, value: &T, ack_mode: AckMode, callback: F)
    where
        T: Serialize + ?Sized,
        F: FnOnce(u64, Result<()>) + Send + 'static,
    {
        match serde_json::to_vec(value) {
            Ok(payload) => {
                self.send(
                    Bytes::from(payload),
                    FrameConfig::data(Encoding::Json, ack_mode),
                    callback,
                )
                .await
            }
            Err(e) => callback(0, Err(e.into())),
        }
    }

    async fn send<F>(&self, payload: Bytes, config: FrameConfig, callback: F)
    where
        F: FnOnce(u64, Result<()>) + Send + 'static,
    {
        let completion = Completion::new(callback);
        if !self.is_accepting() {
            completion.complete(0, Err(QtpError::SenderClosed));
            return;
        }

        let submission = Submission {
            payload,
            config,
            completion,
        };
        if let Err(mpsc::error::SendError(submission)) = self.inner.submit_tx.send(submission).await
        {
            submission.completion.complete(0, Err(QtpError::SenderClosed));
        }
    }

    /// Shut the send side down in order.
    ///
    /// Stops accepting, forwards what was already submitted, closes the
    /// writer (waiting for every outstanding acknowledgment to settle), stops
    /// the ack matcher and finally closes the connection. Idempotent.
    pub async fn close(&self) {
        let first = self.inner.accepting.swap(false, Ordering::AcqRel);
        if first {
            tracing::debug!("Closing sender");
            self.inner.stop_forward.notify_one();
        }
        self.inner.forward.wait().await;

        self.inner.writer.close().await;

        if first {
            self.inner.stop_acks.notify_one();
        }
        self.inner.ack_matcher.wait().await;

        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!("Error closing connection: {}", e);
        }
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Submissions waiting for the forward task.
    pub fn queued(&self) -> usize {
        self.inner.submit_tx.max_capacity() - self.inner.submit_tx.capacity()
    }

    /// Frames waiting for an acknowledgment.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.inner.writer.in_flight()
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("accepting", &self.is_accepting())
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn forward_loop(
    mut rx: mpsc::Receiver<Submission>,
    encoder: Encoder,
    writer: WriterHandle,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;
            submission = rx.recv() => match submission {
                Some(submission) => forward(submission, &encoder, &writer).await,
                None => break,
            },
            _ = stop.notified() => {
                rx.close();
                while let Some(submission) = rx.recv().await {
                    forward(submission, &encoder, &writer).await;
                }
                break;
            }
        }
    }
    tracing::debug!("Forward loop stopped");
}

async fn forward(submission: Submission, encoder: &Encoder, writer: &WriterHandle) {
    let Submission {
        payload,
        config,
        completion,
    } = submission;

    let (seq, frame) = match encoder.encode(&payload, config) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!("Failed to encode frame: {}", e);
            completion.complete(0, Err(e));
            return;
        }
    };

    if config.ack_mode != AckMode::Sync {
        writer
            .submit(SendRequest::new(seq, frame, config.ack_mode, completion))
            .await;
        return;
    }

    let (settled_tx, settled) = oneshot::channel();
    let completion = completion.notify_settled(settled_tx);
    writer
        .submit(SendRequest::new(seq, frame, AckMode::Sync, completion))
        .await;
    let _ = settled.await;
}

async fn ack_loop(mut acks: mpsc::Receiver<Frame>, writer: WriterHandle, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            biased;
            ack = acks.recv() => match ack {
                Some(ack) => {
                    writer.finish(ack.sequence());
                }
                None => break,
            },
            _ = stop.notified() => break,
        }
    }
    tracing::debug!("Ack matcher stopped");
}
