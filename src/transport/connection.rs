//! Connection wrapper with optional transparent reconnect.
//!
//! The stream is split into a read half and a write half, each behind its own
//! lock, so the reader task never blocks writers. Each half remembers the link
//! generation it belongs to; after a reconnect the halves pick up the fresh
//! link from the [`ReconnectPolicy`] independently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

use super::reconnect::{Reconnect, ReconnectPolicy};
use super::Transport;
use crate::error::{QtpError, Result};
use crate::BoxFuture;

struct Side<H> {
    half: H,
    generation: u64,
}

/// A duplex byte stream shared by the reader and writer pipelines.
///
/// Without a policy it is a pass-through and end of stream reads as `Ok(0)`.
/// With a policy, read errors, end of stream and write errors trigger a
/// reconnect and the operation is retried on the new link; once the policy is
/// closed every operation fails with [`QtpError::ConnectionClosed`].
pub struct Connection<S> {
    reader: Mutex<Side<ReadHalf<S>>>,
    writer: Mutex<Side<WriteHalf<S>>>,
    policy: Option<ReconnectPolicy<S>>,
    /// Mirror of the read side's generation, readable without the lock.
    read_generation: AtomicU64,
    closed: AtomicBool,
    closing: Notify,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream without reconnection.
    pub fn new(stream: S) -> Self {
        Self::build(stream, None)
    }

    /// Wrap a stream, reconnecting through `policy` when it breaks.
    pub fn with_reconnect(stream: S, policy: ReconnectPolicy<S>) -> Self {
        Self::build(stream, Some(policy))
    }

    fn build(stream: S, policy: Option<ReconnectPolicy<S>>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Side {
                half: read,
                generation: 0,
            }),
            writer: Mutex::new(Side {
                half: write,
                generation: 0,
            }),
            policy,
            read_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a reconnect policy is attached.
    #[inline]
    pub fn reconnects(&self) -> bool {
        self.policy.is_some()
    }

    /// Generation of the newest link (0 until the first reconnect).
    pub fn generation(&self) -> u64 {
        self.policy.as_ref().map_or(0, ReconnectPolicy::generation)
    }

    /// Generation of the link the read half is currently on.
    pub fn read_generation(&self) -> u64 {
        self.read_generation.load(Ordering::Acquire)
    }

    /// Read some bytes.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.is_closed() {
            return Err(QtpError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            _ = &mut closing => Err(QtpError::ConnectionClosed),
            result = self.read_inner(buf) => result,
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.is_closed() {
            return Err(QtpError::ConnectionClosed);
        }

        tokio::select! {
            biased;
            _ = &mut closing => Err(QtpError::ConnectionClosed),
            result = self.write_inner(buf) => result,
        }
    }

    /// Close the connection.
    ///
    /// Disables reconnection, wakes a reader blocked on the stream and shuts
    /// down the write half. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(policy) = &self.policy {
            policy.close();
        }
        self.closing.notify_waiters();

        let mut side = self.writer.lock().await;
        if let Err(e) = side.half.shutdown().await {
            tracing::debug!("Shutdown of write half failed: {}", e);
        }
        tracing::debug!("Connection closed");
        Ok(())
    }

    async fn read_inner(&self, buf: &mut [u8]) -> Result<usize> {
        let mut side = self.reader.lock().await;

        loop {
            let Some(policy) = &self.policy else {
                return Ok(side.half.read(buf).await?);
            };

            if let Some((generation, half)) = policy.take_read(side.generation) {
                if let Some(half) = half {
                    side.half = half;
                }
                side.generation = generation;
                self.read_generation.store(generation, Ordering::Release);
            }

            let failure = match side.half.read(buf).await {
                Ok(0) if !buf.is_empty() => "end of stream".to_string(),
                Ok(n) => return Ok(n),
                Err(e) => e.to_string(),
            };
            if self.is_closed() {
                return Err(QtpError::ConnectionClosed);
            }

            tracing::debug!(generation = side.generation, "Read failed: {}", failure);
            match policy.try_reconnect(side.generation).await? {
                Reconnect::Reconnected(_) => continue,
                Reconnect::Closed => return Err(QtpError::ConnectionClosed),
            }
        }
    }

    async fn write_inner(&self, buf: &[u8]) -> Result<()> {
        let mut side = self.writer.lock().await;

        loop {
            let Some(policy) = &self.policy else {
                side.half.write_all(buf).await?;
                side.half.flush().await?;
                return Ok(());
            };

            if let Some((generation, half)) = policy.take_write(side.generation) {
                if let Some(half) = half {
                    side.half = half;
                }
                side.generation = generation;
            }

            let outcome = async {
                side.half.write_all(buf).await?;
                side.half.flush().await
            }
            .await;
            let failure = match outcome {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.is_closed() {
                return Err(QtpError::ConnectionClosed);
            }

            tracing::debug!(generation = side.generation, "Write failed: {}", failure);
            match policy.try_reconnect(side.generation).await? {
                Reconnect::Reconnected(_) => continue,
                Reconnect::Closed => return Err(QtpError::ConnectionClosed),
            }
        }
    }
}

impl<S> Transport for Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(Connection::read(self, buf))
    }

    fn write_all<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(Connection::write_all(self, buf))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Connection::close(self))
    }

    fn read_generation(&self) -> u64 {
        Connection::read_generation(self)
    }
}
