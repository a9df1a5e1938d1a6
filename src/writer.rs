//! Dedicated writer task serializing all outbound frames of a connection.
//!
//! # Architecture
//!
//! ```text
//! Sender forward loop ─┐
//! Receiver ACKs ───────┼─► mpsc::Sender<SendRequest> ─► Writer Task ─► Transport
//! ...                  ─┘                                   │
//!                                                          └─► retry lifecycles (SYNC/ASYNC)
//! ```
//!
//! NONE frames are written and completed immediately. SYNC/ASYNC frames are
//! registered in the [`RetryTable`] before the write so an early ACK cannot
//! be missed, then handed to a lifecycle task that completes them on
//! acknowledgment or after the last resend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{QtpError, Result};
use crate::protocol::AckMode;
use crate::retry::{RetryConfig, RetryEntry, RetryTable};
use crate::task_group::TaskGroup;
use crate::transport::Transport;

/// Default send queue capacity.
pub const DEFAULT_SEND_CAPACITY: usize = 1000;

/// Configuration for the writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Capacity of the send request queue.
    pub send_capacity: usize,
    /// Redelivery timing for SYNC/ASYNC frames.
    pub retry: RetryConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            send_capacity: DEFAULT_SEND_CAPACITY,
            retry: RetryConfig::default(),
        }
    }
}

/// Completion callback of a send request.
pub type CompletionFn = Box<dyn FnOnce(u64, Result<()>) + Send + 'static>;

/// Reports the outcome of one send request, exactly once.
pub struct Completion {
    callback: CompletionFn,
    settled: Option<oneshot::Sender<()>>,
}

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(u64, Result<()>) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            settled: None,
        }
    }

    /// A completion that ignores the outcome.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Also fire `settled` after the callback has returned.
    pub(crate) fn notify_settled(mut self, settled: oneshot::Sender<()>) -> Self {
        self.settled = Some(settled);
        self
    }

    /// Invoke the callback, consuming the completion.
    pub fn complete(self, seq: u64, result: Result<()>) {
        (self.callback)(seq, result);
        if let Some(settled) = self.settled {
            let _ = settled.send(());
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// An encoded frame waiting to be written.
#[derive(Debug)]
pub struct SendRequest {
    /// Sequence number carried in the frame header.
    pub seq: u64,
    /// Complete encoded frame, header included.
    pub frame: Vec<u8>,
    pub ack_mode: AckMode,
    pub completion: Completion,
}

impl SendRequest {
    pub fn new(seq: u64, frame: Vec<u8>, ack_mode: AckMode, completion: Completion) -> Self {
        Self {
            seq,
            frame,
            ack_mode,
            completion,
        }
    }

    fn reject(self, error: QtpError) {
        self.completion.complete(self.seq, Err(error));
    }
}

struct Shared {
    tx: mpsc::Sender<SendRequest>,
    table: Arc<RetryTable>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    writer_loop: TaskGroup,
    lifecycles: TaskGroup,
}

/// What the writer task needs; holds no sender, so dropping every handle ends the loop.
struct LoopContext {
    transport: Arc<dyn Transport>,
    table: Arc<RetryTable>,
    shutdown: Arc<Notify>,
    lifecycles: TaskGroup,
    retry: RetryConfig,
}

/// Handle for submitting frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriterHandle {
    shared: Arc<Shared>,
}

impl WriterHandle {
    /// Queue a request for writing.
    ///
    /// Waits while the queue is full. After [`close`](Self::close) the
    /// request's completion fails with [`QtpError::WriterClosed`].
    pub async fn submit(&self, request: SendRequest) {
        if self.is_closed() {
            request.reject(QtpError::WriterClosed);
            return;
        }
        if let Err(mpsc::error::SendError(request)) = self.shared.tx.send(request).await {
            request.reject(QtpError::WriterClosed);
        }
    }

    /// Mark `seq` as acknowledged. Returns false if it was not outstanding.
    pub fn finish(&self, seq: u64) -> bool {
        let found = self.shared.table.acknowledge(seq);
        if !found {
            tracing::debug!(seq, "ACK for unknown or settled frame");
        }
        found
    }

    /// Stop accepting requests, write what was accepted, and wait until every
    /// retry lifecycle has invoked its completion. Idempotent.
    pub async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.shutdown.notify_one();
        }
        self.shared.writer_loop.wait().await;
        self.shared.lifecycles.wait().await;
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Frames waiting for an acknowledgment.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.shared.table.len()
    }

    /// Running retry lifecycles.
    #[inline]
    pub fn lifecycles(&self) -> usize {
        self.shared.lifecycles.count()
    }
}

/// Spawn the writer task and return a handle for submitting frames.
///
/// The `JoinHandle` resolves once the queue is closed and drained.
pub fn spawn_writer(
    transport: Arc<dyn Transport>,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.send_capacity.max(1));
    let shared = Arc::new(Shared {
        tx,
        table: Arc::new(RetryTable::new()),
        closed: AtomicBool::new(false),
        shutdown: Arc::new(Notify::new()),
        writer_loop: TaskGroup::new("writer"),
        lifecycles: TaskGroup::new("lifecycles"),
    });

    let context = LoopContext {
        transport,
        table: Arc::clone(&shared.table),
        shutdown: Arc::clone(&shared.shutdown),
        lifecycles: shared.lifecycles.clone(),
        retry: config.retry,
    };
    let task = shared.writer_loop.spawn(writer_loop(rx, context));

    (WriterHandle { shared }, task)
}

async fn writer_loop(mut rx: mpsc::Receiver<SendRequest>, context: LoopContext) {
    loop {
        tokio::select! {
            biased;
            request = rx.recv() => match request {
                Some(request) => dispatch(request, &context).await,
                None => break,
            },
            _ = context.shutdown.notified() => {
                rx.close();
                while let Some(request) = rx.recv().await {
                    dispatch(request, &context).await;
                }
                break;
            }
        }
    }
    tracing::debug!("Writer loop stopped");
}

async fn dispatch(request: SendRequest, context: &LoopContext) {
    let SendRequest {
        seq,
        frame,
        ack_mode,
        completion,
    } = request;

    if ack_mode == AckMode::None {
        let result = context.transport.write_all(&frame).await;
        if let Err(e) = &result {
            tracing::warn!(seq, "Write failed: {}", e);
        }
        completion.complete(seq, result);
        return;
    }

    let (ticket, acked) = context.table.register(seq);
    if let Err(e) = context.transport.write_all(&frame).await {
        tracing::warn!(seq, "Write failed: {}", e);
        context.table.abandon(ticket);
        completion.complete(seq, Err(e));
        return;
    }

    tracing::debug!(seq, ?ack_mode, "Frame written, awaiting ACK");
    let entry = RetryEntry::new(ticket, frame, Instant::now(), context.retry, acked, completion);
    context.lifecycles.spawn(entry.run(
        Arc::clone(&context.transport),
        Arc::clone(&context.table),
    ));
}
