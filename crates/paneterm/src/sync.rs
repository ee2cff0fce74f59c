//! Settle-once latches and the bounded session lock.
//!
//! A [`Latch`] is written at most once and can be awaited by any number of
//! tasks, before or after it is written. Session shell and exit futures are
//! latches holding a `Result`, wrapped in [`Outcome`] so they can be
//! `.await`ed directly.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::{PseudoterminalError, Result};

/// Default bound on tasks queued behind a [`SyncLock`].
pub const DEFAULT_MAX_PENDING: usize = 1000;

/// A value that is set at most once.
#[derive(Debug)]
pub struct Latch<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Latch<T> {
    /// Create an unset latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Set the value. Returns `false` (and drops `value`) if already set.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = value.take();
                true
            }
        })
    }

    /// Current value, if set.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// A handle that resolves once the latch is set.
    pub fn waiter(&self) -> LatchWaiter<T> {
        LatchWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaits a [`Latch`].
#[derive(Debug, Clone)]
pub struct LatchWaiter<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> LatchWaiter<T> {
    /// Wait for the value. `None` means the latch was dropped unset.
    pub async fn wait(mut self) -> Option<T> {
        let value = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        value
    }

    /// Current value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

/// Awaitable outcome of a session operation (its shell, its exit).
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    waiter: LatchWaiter<Result<T>>,
}

impl<T: Clone + Send + Sync + 'static> Outcome<T> {
    pub fn new(waiter: LatchWaiter<Result<T>>) -> Self {
        Self { waiter }
    }

    /// The outcome if it has already settled.
    pub fn peek(&self) -> Option<Result<T>> {
        self.waiter.peek()
    }

    pub fn is_settled(&self) -> bool {
        self.waiter.peek().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Outcome<T> {
    type Output = Result<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.waiter
                .wait()
                .await
                .unwrap_or(Err(PseudoterminalError::Abandoned))
        })
    }
}

/// Latch holding a fallible outcome.
pub type OutcomeLatch<T> = Latch<Result<T>>;

impl<T: Clone + Send + Sync + 'static> Latch<Result<T>> {
    /// An awaitable view of this latch.
    pub fn outcome(&self) -> Outcome<T> {
        Outcome::new(self.waiter())
    }
}

/// Async mutex that refuses new waiters past a bound.
///
/// Operations on a session (repaints, edits, history swaps) are serialized
/// through one of these. A runaway producer gets [`PseudoterminalError::LockBusy`]
/// instead of an unbounded queue.
#[derive(Debug)]
pub struct SyncLock<T> {
    mutex: Mutex<T>,
    pending: AtomicUsize,
    max_pending: usize,
}

impl<T> SyncLock<T> {
    pub fn new(value: T) -> Self {
        Self::with_max_pending(value, DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(value: T, max_pending: usize) -> Self {
        Self {
            mutex: Mutex::new(value),
            pending: AtomicUsize::new(0),
            max_pending,
        }
    }

    /// Number of tasks currently waiting.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Acquire the lock, queueing behind current holders.
    pub async fn lock(&self) -> Result<MutexGuard<'_, T>> {
        if let Ok(guard) = self.mutex.try_lock() {
            return Ok(guard);
        }
        let waiting = self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(&self.pending);
        if waiting >= self.max_pending {
            return Err(PseudoterminalError::LockBusy(waiting));
        }
        Ok(self.mutex.lock().await)
    }
}

/// Decrements the pending count even if the waiting future is cancelled.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
