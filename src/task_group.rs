//! Counted task groups for graceful shutdown.
//!
//! Each pipeline keeps one group per kind of background work (retry
//! lifecycles, callback dispatch, forward loop). Shutdown waits on a group
//! until every task spawned into it has finished.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Inner {
    name: &'static str,
    running: AtomicUsize,
    idle: Notify,
}

/// A named set of spawned tasks that can be awaited as a whole.
///
/// Cloning yields another handle to the same group.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

/// Decrements the running count when the task ends, even by panic.
struct RunningGuard {
    inner: Arc<Inner>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.inner.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl TaskGroup {
    /// Create an empty group.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                running: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Spawn a task into the group.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.running.fetch_add(1, Ordering::AcqRel);
        let guard = RunningGuard {
            inner: Arc::clone(&self.inner),
        };
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    /// Number of tasks still running.
    #[inline]
    pub fn count(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Wait until no task in the group is running.
    ///
    /// Returns immediately for an idle group. Tasks spawned while waiting
    /// are waited for too.
    pub async fn wait(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }
}
