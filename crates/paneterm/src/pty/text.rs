//! Static text sessions.

use std::future::IntoFuture;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use protocol::control::normalize_line_endings;
use protocol::{ExitStatus, EXIT_SUCCESS};
use tokio::sync::broadcast;

use super::{ExitWaiter, Pseudoterminal};
use crate::display::{clear_display, AttachedDisplays, DisplayEvent, TerminalDisplay};
use crate::error::{DisplayError, PseudoterminalError, Result};
use crate::sync::{Latch, OutcomeLatch, SyncLock};

struct Inner {
    text: Mutex<String>,
    displays: AttachedDisplays,
    /// Serializes clear-and-write pairs.
    sync: SyncLock<()>,
    exit: OutcomeLatch<ExitStatus>,
}

impl Inner {
    fn text(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, text: String) {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = text;
    }

    async fn rewrite_all(&self) -> Result<()> {
        let _guard = self.sync.lock().await?;
        let text = normalize_line_endings(&self.text());
        let displays = self.displays.snapshot();
        let results = join_all(displays.iter().map(|d| paint(d.as_ref(), &text))).await;
        for (target, result) in displays.iter().zip(results) {
            if let Err(e) = result {
                let display_id = target.id();
                tracing::debug!(display_id = %display_id, error = %e, "Failed to repaint text");
            }
        }
        Ok(())
    }

    async fn rewrite(&self, display: &dyn TerminalDisplay) -> Result<()> {
        let _guard = self.sync.lock().await?;
        let text = normalize_line_endings(&self.text());
        paint(display, &text).await?;
        Ok(())
    }
}

async fn paint(display: &dyn TerminalDisplay, text: &str) -> std::result::Result<(), DisplayError> {
    clear_display(display, false).await?;
    display.write(text.as_bytes()).await
}

/// A session that shows a piece of text.
///
/// Every attached display shows the current text. Replacing it repaints
/// all of them; repaints never interleave.
pub struct TextPseudoterminal {
    inner: Arc<Inner>,
}

impl TextPseudoterminal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                text: Mutex::new(text.into()),
                displays: AttachedDisplays::new(),
                sync: SyncLock::new(()),
                exit: Latch::new(),
            }),
        }
    }

    pub fn text(&self) -> String {
        self.inner.text()
    }

    /// Replace the text and schedule a repaint.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn set_text(&self, text: impl Into<String>) {
        self.inner.store(text.into());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.rewrite_all().await {
                tracing::warn!(error = %e, "Failed to schedule text repaint");
            }
        });
    }

    /// Replace the text and wait for every display to be repainted.
    pub async fn update_text(&self, text: impl Into<String>) -> Result<()> {
        self.inner.store(text.into());
        self.inner.rewrite_all().await
    }

    /// Ids of the attached displays.
    pub fn display_ids(&self) -> Vec<String> {
        self.inner.displays.ids()
    }
}

impl Default for TextPseudoterminal {
    fn default() -> Self {
        Self::new("")
    }
}

async fn watch_disposal(
    inner: Weak<Inner>,
    display_id: String,
    mut events: broadcast::Receiver<DisplayEvent>,
    exit: ExitWaiter,
) {
    let mut exited = exit.into_future();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DisplayEvent::Disposed) | Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            },
            _ = &mut exited => return,
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.displays.detach(&display_id);
        tracing::debug!(display_id = %display_id, "Detached disposed display");
    }
}

#[async_trait]
impl Pseudoterminal for TextPseudoterminal {
    async fn kill(&self) -> Result<()> {
        self.inner.exit.set(Ok(EXIT_SUCCESS));
        self.inner.displays.clear();
        Ok(())
    }

    fn on_exit(&self) -> ExitWaiter {
        self.inner.exit.outcome()
    }

    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()> {
        if self.inner.exit.is_set() {
            return Err(PseudoterminalError::Exited);
        }
        if self.inner.displays.attach(Arc::clone(&display)) {
            tokio::spawn(watch_disposal(
                Arc::downgrade(&self.inner),
                display.id(),
                display.subscribe(),
                self.inner.exit.outcome(),
            ));
        }
        self.inner.rewrite(display.as_ref()).await
    }
}
