//! Reference-counted session sharing.
//!
//! One delegate session can back several views. Every view holds its own
//! [`RefPseudoterminal`] handle with a private exit latch. Releasing a
//! handle while others remain settles that handle with success; releasing
//! the last one kills the delegate. When the delegate exits, every handle
//! that has not been released settles with the real exit descriptor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use protocol::{ExitStatus, EXIT_SUCCESS};

use super::{ExitWaiter, Pseudoterminal, ShellFuture};
use crate::display::TerminalDisplay;
use crate::error::Result;
use crate::sync::{Latch, OutcomeLatch};

struct Handle {
    exit: OutcomeLatch<ExitStatus>,
    released: AtomicBool,
}

impl Handle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            exit: Latch::new(),
            released: AtomicBool::new(false),
        })
    }
}

struct SharedState {
    /// Handles not yet released.
    live: usize,
    /// The delegate's exit, once known.
    outcome: Option<Result<ExitStatus>>,
    /// Handles awaiting the delegate's exit.
    handles: Vec<Weak<Handle>>,
}

struct Shared<T> {
    delegate: T,
    state: Mutex<SharedState>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Result<ExitStatus>) {
        let mut state = self.lock();
        for handle in state.handles.drain(..).filter_map(|h| h.upgrade()) {
            handle.exit.set(outcome.clone());
        }
        state.outcome = Some(outcome);
    }
}

/// A shared handle to a delegate session.
pub struct RefPseudoterminal<T> {
    shared: Arc<Shared<T>>,
    handle: Arc<Handle>,
}

impl<T: Pseudoterminal + 'static> RefPseudoterminal<T> {
    /// Wrap a delegate. Must be called inside a Tokio runtime.
    pub fn new(delegate: T) -> Self {
        let handle = Handle::new();
        let exit = delegate.on_exit();
        let shared = Arc::new(Shared {
            delegate,
            state: Mutex::new(SharedState {
                live: 1,
                outcome: None,
                handles: vec![Arc::downgrade(&handle)],
            }),
        });

        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            let outcome = exit.await;
            if let Some(shared) = weak.upgrade() {
                shared.settle(outcome);
            }
        });

        Self { shared, handle }
    }

    /// Another handle to the same delegate.
    pub fn dup(&self) -> Self {
        let handle = Handle::new();
        let mut state = self.shared.lock();
        state.live += 1;
        match state.outcome {
            Some(ref outcome) => {
                handle.exit.set(outcome.clone());
            }
            None => {
                state.handles.retain(|h| h.strong_count() > 0);
                state.handles.push(Arc::downgrade(&handle));
            }
        }
        drop(state);

        Self {
            shared: Arc::clone(&self.shared),
            handle,
        }
    }

    pub fn delegate(&self) -> &T {
        &self.shared.delegate
    }

    /// Handles that have not been released.
    pub fn ref_count(&self) -> usize {
        self.shared.lock().live
    }
}

#[async_trait]
impl<T: Pseudoterminal + 'static> Pseudoterminal for RefPseudoterminal<T> {
    fn shell(&self) -> Option<ShellFuture> {
        self.shared.delegate.shell()
    }

    /// Release this handle. Repeat calls are no-ops.
    async fn kill(&self) -> Result<()> {
        if self.handle.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (last, exited) = {
            let mut state = self.shared.lock();
            state.live = state.live.saturating_sub(1);
            (state.live == 0, state.outcome.is_some())
        };

        if !last {
            self.handle.exit.set(Ok(EXIT_SUCCESS));
            return Ok(());
        }
        if exited {
            return Ok(());
        }

        if let Err(e) = self.shared.delegate.kill().await {
            // Leave the handle usable so the caller can retry.
            self.shared.lock().live += 1;
            self.handle.released.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn on_exit(&self) -> ExitWaiter {
        self.handle.exit.outcome()
    }

    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()> {
        self.shared.delegate.pipe(display).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.shared.delegate.resize(cols, rows).await
    }
}
