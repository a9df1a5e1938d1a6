//! Acknowledgment tracking and timed redelivery.
//!
//! Every SYNC/ASYNC frame gets a [`RetryTable`] entry before it is written
//! and a lifecycle task after. The lifecycle ends in exactly one of two ways:
//!
//! ```text
//!   written ──► wait (timeout - elapsed) ──┬─► ack ─────────────────────► Ok
//!                                          └─► expired ─► resend, wait ──┬─► ack ─► Ok
//!                                                 ▲      (interval)     │
//!                                                 └──── attempts left ◄─┤
//!                                                                       └─► exhausted ─► DeliveryFailed
//! ```
//!
//! Resent frames carry the RETRY kind so the peer can recognize duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{QtpError, Result};
use crate::protocol::{offsets, MessageKind};
use crate::transport::Transport;
use crate::writer::Completion;

/// Default number of resends after the first timeout.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;

/// Default time to wait for an acknowledgment of the original write.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for an acknowledgment after each resend.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Redelivery timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Resends before giving up.
    pub attempts: usize,
    /// Acknowledgment window for the original write, measured from the write.
    #[serde(with = "crate::config::millis", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Acknowledgment window after each resend.
    #[serde(with = "crate::config::millis", rename = "interval_ms")]
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            timeout: DEFAULT_RETRY_TIMEOUT,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Identifies one registration of a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub seq: u64,
    id: u64,
}

struct Pending {
    id: u64,
    acked: oneshot::Sender<()>,
}

/// Outstanding acknowledgments keyed by sequence number.
///
/// Each entry is removed exactly once: by [`acknowledge`](Self::acknowledge)
/// when the peer's ACK arrives, or by [`abandon`](Self::abandon) when the
/// lifecycle gives up or the initial write fails.
#[derive(Default)]
pub struct RetryTable {
    entries: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
}

impl RetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `seq` and get the signal that fires on acknowledgment.
    ///
    /// Registering a sequence that is still outstanding replaces the older
    /// entry; the older signal is dropped.
    pub fn register(&self, seq: u64) -> (Ticket, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(seq, Pending { id, acked: tx }).is_some() {
            tracing::warn!(seq, "Sequence registered twice, replacing older entry");
        }
        (Ticket { seq, id }, rx)
    }

    /// Remove `seq` and fire its signal. Returns false if it was not outstanding.
    pub fn acknowledge(&self, seq: u64) -> bool {
        let mut entries = self.lock();
        match entries.remove(&seq) {
            Some(pending) => {
                let _ = pending.acked.send(());
                true
            }
            None => false,
        }
    }

    /// Remove the entry created for `ticket`. Returns false if it is gone.
    pub fn abandon(&self, ticket: Ticket) -> bool {
        let mut entries = self.lock();
        match entries.get(&ticket.seq) {
            Some(pending) if pending.id == ticket.id => {
                entries.remove(&ticket.seq);
                true
            }
            _ => false,
        }
    }

    /// Number of outstanding acknowledgments.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lifecycle state of one SYNC/ASYNC frame after its initial write.
pub(crate) struct RetryEntry {
    ticket: Ticket,
    frame: Vec<u8>,
    sent_at: Instant,
    config: RetryConfig,
    acked: oneshot::Receiver<()>,
    completion: Completion,
}

impl RetryEntry {
    pub(crate) fn new(
        ticket: Ticket,
        frame: Vec<u8>,
        sent_at: Instant,
        config: RetryConfig,
        acked: oneshot::Receiver<()>,
        completion: Completion,
    ) -> Self {
        Self {
            ticket,
            frame,
            sent_at,
            config,
            acked,
            completion,
        }
    }

    /// Drive the lifecycle to its end and invoke the completion.
    pub(crate) async fn run(self, transport: Arc<dyn Transport>, table: Arc<RetryTable>) {
        let RetryEntry {
            ticket,
            mut frame,
            sent_at,
            config,
            mut acked,
            completion,
        } = self;
        let seq = ticket.seq;

        let result = async {
            tokio::select! {
                ack = &mut acked => return settle(ack, seq, 0),
                _ = tokio::time::sleep_until(sent_at + config.timeout) => {}
            }

            frame[offsets::KIND] = MessageKind::Retry as u8;
            for attempt in 1..=config.attempts {
                tracing::debug!(seq, attempt, "Resending unacknowledged frame");
                if let Err(e) = transport.write_all(&frame).await {
                    tracing::warn!(seq, attempt, "Resend failed: {}", e);
                }

                tokio::select! {
                    ack = &mut acked => return settle(ack, seq, attempt),
                    _ = tokio::time::sleep(config.interval) => {}
                }
            }

            if table.abandon(ticket) {
                return Err(QtpError::DeliveryFailed {
                    seq,
                    attempts: config.attempts,
                });
            }
            // Removed by someone else: either the ACK won the race or a newer
            // registration displaced this one.
            settle(acked.try_recv().map_err(|_| ()), seq, config.attempts)
        }
        .await;

        if let Err(e) = &result {
            tracing::debug!(seq, "Delivery failed: {}", e);
        }
        completion.complete(seq, result);
    }
}

fn settle<E>(ack: std::result::Result<(), E>, seq: u64, attempts: usize) -> Result<()> {
    ack.map_err(|_| QtpError::DeliveryFailed { seq, attempts })
}
