//! Single-flight reconnection.
//!
//! When a read or write fails, every task touching the connection asks the
//! policy for a new link. Only the first caller dials; the rest wait on a
//! [`Notify`] and observe the same round's outcome.
//!
//! ```text
//!   caller A ──► try_reconnect(gen 0) ──► dial, dial, ... ──► generation 1
//!   caller B ──► try_reconnect(gen 0) ──► wait ───────────────► generation 1
//!   caller C ──► try_reconnect(gen 1) ──► (newer link exists) ─► generation 1
//! ```
//!
//! A round that exhausts its attempts closes the policy for good.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Notify;

use crate::error::{QtpError, Result};
use crate::BoxFuture;

/// Default number of dial attempts per reconnect round.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Default delay between dial attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Produces a fresh stream to the same peer.
pub trait Dialer<S>: Send + Sync + 'static {
    fn dial(&self) -> BoxFuture<'_, Result<S>>;
}

impl<S, F, Fut> Dialer<S> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
{
    fn dial(&self) -> BoxFuture<'_, Result<S>> {
        Box::pin(self())
    }
}

/// Reconnect configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Dial attempts per round.
    pub max_attempts: usize,
    /// Pause between failed attempts.
    #[serde(with = "crate::config::millis", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Outcome of [`ReconnectPolicy::try_reconnect`] that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// A link newer than the caller's is installed.
    Reconnected(u64),
    /// The policy is closed; no further reconnects will happen.
    Closed,
}

struct ReconnectState<S> {
    /// Generation of the newest link. The initial link is generation 0.
    generation: u64,
    /// Completed rounds, successful or not.
    rounds: u64,
    in_progress: bool,
    closed: bool,
    last_failure: Option<String>,
    fresh_read: Option<ReadHalf<S>>,
    fresh_write: Option<WriteHalf<S>>,
}

/// Bounded-attempt reconnection shared by all users of one connection.
pub struct ReconnectPolicy<S> {
    dialer: Box<dyn Dialer<S>>,
    config: ReconnectConfig,
    state: Mutex<ReconnectState<S>>,
    finished: Notify,
}

/// Releases the in-progress flag if the executing caller is dropped mid-round.
struct RoundGuard<'a, S> {
    policy: &'a ReconnectPolicy<S>,
    armed: bool,
}

impl<S> Drop for RoundGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.policy.lock().in_progress = false;
            self.policy.finished.notify_waiters();
        }
    }
}

impl<S> ReconnectPolicy<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a policy around a dialer.
    pub fn new<D>(dialer: D, config: ReconnectConfig) -> Self
    where
        D: Dialer<S>,
    {
        Self {
            dialer: Box::new(dialer),
            config,
            state: Mutex::new(ReconnectState {
                generation: 0,
                rounds: 0,
                in_progress: false,
                closed: false,
                last_failure: None,
                fresh_read: None,
                fresh_write: None,
            }),
            finished: Notify::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Generation of the newest link.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Permanently disable reconnection and wake all waiters.
    pub fn close(&self) {
        self.lock().closed = true;
        self.finished.notify_waiters();
    }

    /// Obtain a link newer than `seen_generation`, dialing if nobody else is.
    ///
    /// Callers waiting on another caller's round get that round's outcome:
    /// the new generation, or the same `ReconnectExhausted` error.
    pub async fn try_reconnect(&self, seen_generation: u64) -> Result<Reconnect> {
        let mut waited_round = None;

        loop {
            let finished = self.finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();

            {
                let mut state = self.lock();
                if state.generation > seen_generation {
                    return Ok(Reconnect::Reconnected(state.generation));
                }
                if let Some(round) = waited_round {
                    if state.rounds > round {
                        if let Some(reason) = &state.last_failure {
                            return Err(QtpError::ReconnectExhausted {
                                attempts: self.config.max_attempts,
                                reason: reason.clone(),
                            });
                        }
                    }
                }
                if state.closed {
                    return Ok(Reconnect::Closed);
                }
                if !state.in_progress {
                    state.in_progress = true;
                    break;
                }
                waited_round = Some(state.rounds);
            }

            finished.await;
        }

        self.run_round().await
    }

    /// Take the read half of a link newer than `seen_generation`.
    ///
    /// Returns the newest generation whenever it is newer, with the half if
    /// it has not been taken yet.
    pub fn take_read(&self, seen_generation: u64) -> Option<(u64, Option<ReadHalf<S>>)> {
        let mut state = self.lock();
        (state.generation > seen_generation).then(|| (state.generation, state.fresh_read.take()))
    }

    /// Take the write half of a link newer than `seen_generation`.
    pub fn take_write(&self, seen_generation: u64) -> Option<(u64, Option<WriteHalf<S>>)> {
        let mut state = self.lock();
        (state.generation > seen_generation).then(|| (state.generation, state.fresh_write.take()))
    }

    async fn run_round(&self) -> Result<Reconnect> {
        let mut guard = RoundGuard {
            policy: self,
            armed: true,
        };

        tracing::warn!("Connection lost, reconnecting");
        let outcome = self.dial_with_retries().await;

        guard.armed = false;
        let result = {
            let mut state = self.lock();
            state.in_progress = false;
            state.rounds += 1;

            match outcome {
                Ok(stream) if !state.closed => {
                    let (read, write) = tokio::io::split(stream);
                    state.generation += 1;
                    state.fresh_read = Some(read);
                    state.fresh_write = Some(write);
                    state.last_failure = None;
                    tracing::info!(generation = state.generation, "Reconnected");
                    Ok(Reconnect::Reconnected(state.generation))
                }
                Ok(_) => Ok(Reconnect::Closed),
                Err(reason) => {
                    state.closed = true;
                    state.last_failure = Some(reason.clone());
                    tracing::error!(
                        attempts = self.config.max_attempts,
                        "Reconnect failed, giving up: {}",
                        reason
                    );
                    Err(QtpError::ReconnectExhausted {
                        attempts: self.config.max_attempts,
                        reason,
                    })
                }
            }
        };

        self.finished.notify_waiters();
        result
    }

    async fn dial_with_retries(&self) -> std::result::Result<S, String> {
        let mut last_error = "no reconnect attempts configured".to_string();

        for attempt in 1..=self.config.max_attempts {
            if self.is_closed() {
                return Err("connection closed locally".to_string());
            }
            match self.dialer.dial().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::warn!(attempt, "Reconnect attempt failed: {}", e);
                    last_error = e.to_string();
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(last_error)
    }
}

impl<S> ReconnectPolicy<S> {
    fn lock(&self) -> MutexGuard<'_, ReconnectState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> std::fmt::Debug for ReconnectPolicy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    fn counting_dialer(
        dials: Arc<AtomicUsize>,
        succeed: bool,
    ) -> impl Fn() -> BoxFuture<'static, Result<DuplexStream>> + Send + Sync + 'static {
        move || {
            let dials = Arc::clone(&dials);
            Box::pin(async move {
                dials.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                if succeed {
                    let (stream, _peer) = tokio::io::duplex(64);
                    Ok(stream)
                } else {
                    Err(QtpError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )))
                }
            })
        }
    }

    fn config(max_attempts: usize) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            retry_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_dial() {
        let dials = Arc::new(AtomicUsize::new(0));
        let policy = Arc::new(ReconnectPolicy::new(
            counting_dialer(Arc::clone(&dials), true),
            config(3),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = Arc::clone(&policy);
                tokio::spawn(async move { policy.try_reconnect(0).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap(),
                Reconnect::Reconnected(1)
            );
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(policy.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_failure() {
        let dials = Arc::new(AtomicUsize::new(0));
        let policy = Arc::new(ReconnectPolicy::new(
            counting_dialer(Arc::clone(&dials), false),
            config(3),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let policy = Arc::clone(&policy);
                tokio::spawn(async move { policy.try_reconnect(0).await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                QtpError::ReconnectExhausted { attempts: 3, .. }
            ));
        }
        assert_eq!(dials.load(Ordering::SeqCst), 3);
        assert!(policy.is_closed());

        // Later callers see a closed policy without dialing again.
        assert_eq!(policy.try_reconnect(0).await.unwrap(), Reconnect::Closed);
        assert_eq!(dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_generation_returned_without_dialing() {
        let dials = Arc::new(AtomicUsize::new(0));
        let policy = ReconnectPolicy::new(counting_dialer(Arc::clone(&dials), true), config(1));

        assert_eq!(policy.try_reconnect(0).await.unwrap(), Reconnect::Reconnected(1));
        assert_eq!(policy.try_reconnect(0).await.unwrap(), Reconnect::Reconnected(1));
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        // A caller already on generation 1 starts a new round.
        assert_eq!(policy.try_reconnect(1).await.unwrap(), Reconnect::Reconnected(2));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_halves_taken_once() {
        let dials = Arc::new(AtomicUsize::new(0));
        let policy = ReconnectPolicy::new(counting_dialer(dials, true), config(1));
        policy.try_reconnect(0).await.unwrap();

        let (generation, half) = policy.take_read(0).unwrap();
        assert_eq!(generation, 1);
        assert!(half.is_some());
        assert!(policy.take_read(0).unwrap().1.is_none());
        assert!(policy.take_read(1).is_none());
        assert!(policy.take_write(0).unwrap().1.is_some());
    }

    #[tokio::test]
    async fn test_closed_policy_never_dials() {
        let dials = Arc::new(AtomicUsize::new(0));
        let policy = ReconnectPolicy::new(counting_dialer(Arc::clone(&dials), true), config(3));
        policy.close();

        assert_eq!(policy.try_reconnect(0).await.unwrap(), Reconnect::Closed);
        assert_eq!(dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_executor_releases_round() {
        let dials = Arc::new(AtomicUsize::new(0));
        let policy = Arc::new(ReconnectPolicy::new(
            counting_dialer(Arc::clone(&dials), true),
            config(1),
        ));

        let executor = {
            let policy = Arc::clone(&policy);
            tokio::spawn(async move { policy.try_reconnect(0).await })
        };
        tokio::task::yield_now().await;
        executor.abort();
        let _ = executor.await;

        assert_eq!(policy.try_reconnect(0).await.unwrap(), Reconnect::Reconnected(1));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }
}
