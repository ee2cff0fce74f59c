//! The developer console session.
//!
//! Tails a [`LogStream`] into every attached display and offers a script
//! prompt below it. Each display keeps an [`Editor`] anchor marking where
//! the prompt starts; log output is written at the anchor and the prompt
//! is repainted after it.
//!
//! ```text
//!   LogStream ──► tail_log ──► write ──┐
//!                                      ├──► displays (one lock)
//!   display events ──► input/keys ─────┘
//!                          │
//!                          └──► evaluate ──► ScriptEngine ──► LogStream
//! ```

pub mod engine;
pub mod eval;
pub mod format;
pub mod history;

use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use protocol::control::{
    cursor_column, cursor_position, cursor_up, erase_display, erase_line, normalize_line_endings,
    Erase, CRLF,
};
use protocol::{ExitStatus, LogEntry, LogRecord, EXIT_SUCCESS};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::display::{
    AttachedDisplays, DisplayEvent, DisplayId, Key, KeyEvent, Marker, TerminalDisplay,
};
use crate::error::{PseudoterminalError, Result};
use crate::logging::LogStream;
use crate::pty::{ExitWaiter, Pseudoterminal};
use crate::sync::{Latch, OutcomeLatch, SyncLock, DEFAULT_MAX_PENDING};
use crate::text::TerminalTextArea;

pub use engine::{EvalOutcome, EvalRequest, EvalResponse, ScriptEngine, TerminalInfo, DEFAULT_EVAL_TIMEOUT};
pub use eval::{prepare, Rewrite, SourceDeletions, CONTEXT_NAME};
pub use format::{LogFormatter, DEFAULT_INSPECT_DEPTH};
pub use history::ConsoleHistory;

/// Tuning for a console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleOptions {
    /// Initial inspection depth (`$$.depth`).
    pub depth: u32,
    /// Longest a single evaluation may run.
    pub eval_timeout: Duration,
    /// Bound on operations queued behind the session lock.
    pub max_pending: usize,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            depth: DEFAULT_INSPECT_DEPTH,
            eval_timeout: DEFAULT_EVAL_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Where the prompt sits on one display.
#[derive(Debug, Default)]
pub struct Editor {
    /// Column the prompt's first row starts at.
    pub start_x: usize,
    /// Anchor on the prompt's first row.
    pub start_y_marker: Option<Marker>,
    /// Prompt row (relative to the first) painted last, as of the last repaint.
    pub render_end_y: usize,
}

impl Editor {
    fn close(&self) {
        if let Some(marker) = &self.start_y_marker {
            marker.dispose();
        }
    }
}

/// Everything guarded by the session lock.
#[derive(Default)]
struct ConsoleState {
    buffer: TerminalTextArea,
    history: ConsoleHistory,
    editors: HashMap<DisplayId, Editor>,
    /// Newest log entry written to each display.
    seen: HashMap<DisplayId, u64>,
}

impl ConsoleState {
    fn set_editor(&mut self, id: &str, editor: Option<Editor>) {
        let previous = match editor {
            Some(editor) => self.editors.insert(id.to_string(), editor),
            None => self.editors.remove(id),
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }
}

struct Inner {
    log: LogStream,
    formatter: LogFormatter,
    engine: ScriptEngine,
    displays: AttachedDisplays,
    state: SyncLock<ConsoleState>,
    exit: OutcomeLatch<ExitStatus>,
}

impl Inner {
    fn terminals(&self) -> Vec<TerminalInfo> {
        self.displays
            .snapshot()
            .iter()
            .map(|display| {
                let size = display.size();
                TerminalInfo {
                    id: display.id(),
                    cols: size.cols,
                    rows: size.rows,
                }
            })
            .collect()
    }

    /// Write log entries to every attached display.
    async fn flush(&self, entries: &[Arc<LogEntry>]) -> Result<()> {
        let mut state = self.state.lock().await?;
        let displays = self.displays.snapshot();
        self.write(&mut state, entries, &displays).await;
        Ok(())
    }

    /// Write log entries above the prompt, then repaint the prompt.
    ///
    /// Entries a display has already shown are skipped for it.
    async fn write(
        &self,
        state: &mut ConsoleState,
        entries: &[Arc<LogEntry>],
        displays: &[Arc<dyn TerminalDisplay>],
    ) {
        let mut touched = Vec::with_capacity(displays.len());
        for display in displays {
            let id = display.id();
            let seen = state.seen.get(&id).copied().unwrap_or(0);
            let fresh: Vec<&Arc<LogEntry>> = entries.iter().filter(|e| e.id > seen).collect();

            if fresh.is_empty() {
                if !state.editors.contains_key(&id) {
                    let (x, _) = display.cursor();
                    state.set_editor(
                        &id,
                        Some(Editor {
                            start_x: usize::from(x),
                            start_y_marker: display.register_marker(),
                            render_end_y: 0,
                        }),
                    );
                    touched.push(Arc::clone(display));
                }
                continue;
            }

            let joined = fresh
                .iter()
                .map(|entry| self.formatter.format(entry))
                .collect::<Vec<_>>()
                .join("\n");
            let el = erase_line(Erase::Below);
            let text = format!(
                "{el}{}{CRLF}",
                normalize_line_endings(&joined).replace(CRLF, &format!("{CRLF}{el}"))
            );

            let base_y = display.base_y();
            let (_, cursor_y) = display.cursor();
            let start = state
                .editors
                .get(&id)
                .and_then(|e| e.start_y_marker.as_ref())
                .and_then(Marker::line)
                .unwrap_or(base_y + usize::from(cursor_y));
            let out = format!(
                "{}{}{}",
                cursor_position(1 + start.saturating_sub(base_y), 1),
                erase_display(Erase::Below),
                text
            );
            if let Err(e) = display.write(out.as_bytes()).await {
                tracing::debug!(display_id = %id, error = %e, "Failed to write log output");
                continue;
            }

            if let Some(newest) = fresh.last() {
                state.seen.insert(id.clone(), newest.id);
            }
            let (x, _) = display.cursor();
            state.set_editor(
                &id,
                Some(Editor {
                    start_x: usize::from(x),
                    start_y_marker: display.register_marker(),
                    render_end_y: 0,
                }),
            );
            touched.push(Arc::clone(display));
        }
        sync_buffer(state, &touched).await;
    }

    async fn input(&self, data: &str) -> Result<()> {
        let mut state = self.state.lock().await?;
        state.buffer.write(data);
        let draft = state.buffer.value().text.clone();
        state.history.set_draft(&draft);
        sync_buffer(&mut state, &self.displays.snapshot()).await;
        Ok(())
    }

    /// Show the previous or next history entry. `false` when navigation is
    /// unavailable and the key should edit the buffer instead.
    async fn navigate(&self, backwards: bool) -> Result<bool> {
        let mut state = self.state.lock().await?;
        let entry = if backwards {
            state.history.previous()
        } else {
            state.history.next()
        };
        let Some(entry) = entry.map(str::to_string) else {
            return Ok(false);
        };
        state.buffer.set_value(&entry);
        sync_buffer(&mut state, &self.displays.snapshot()).await;
        Ok(true)
    }

    /// Take the buffer for evaluation, leaving an empty prompt.
    async fn submit(&self) -> Result<String> {
        let mut state = self.state.lock().await?;
        let code = state.buffer.clear().text;
        state.history.commit(&code);
        sync_buffer(&mut state, &self.displays.snapshot()).await;
        Ok(code)
    }

    async fn reflow(&self, display: &Arc<dyn TerminalDisplay>) -> Result<()> {
        let mut state = self.state.lock().await?;
        sync_buffer(&mut state, std::slice::from_ref(display)).await;
        Ok(())
    }

    async fn evaluate(&self, code: String) {
        self.log.publish(LogRecord::info(code.clone()));

        let request = |source: String, deletions: SourceDeletions, capture: bool| EvalRequest {
            source,
            deletions,
            capture,
            depth: self.formatter.depth(),
            terminals: self.terminals(),
        };

        let mut response = None;
        if let Some(rewrite) = prepare(&code) {
            let rewritten = self
                .engine
                .evaluate(request(rewrite.source, rewrite.deletions, true))
                .await;
            match &rewritten.outcome {
                EvalOutcome::SyntaxError(text) => {
                    tracing::debug!(error = %text, "Rewritten input did not compile, evaluating as written");
                }
                _ => response = Some(rewritten),
            }
        }
        let response = match response {
            Some(response) => response,
            None => {
                self.engine
                    .evaluate(request(code, SourceDeletions::new(), false))
                    .await
            }
        };

        if let Some(depth) = response.depth {
            self.formatter.set_depth(depth);
        }
        match response.outcome {
            EvalOutcome::Done => {}
            EvalOutcome::Value(Some(value)) => {
                self.log.publish(LogRecord::Info(vec![value]));
            }
            EvalOutcome::Value(None) => {
                self.log.publish(LogRecord::info("undefined"));
            }
            EvalOutcome::SyntaxError(text) | EvalOutcome::Error(text) => {
                self.log.publish(LogRecord::error(text));
            }
            EvalOutcome::Pending => {
                tracing::debug!("Evaluation left pending work behind");
            }
        }
    }

    async fn detach(&self, id: &str) {
        self.displays.detach(id);
        match self.state.lock().await {
            Ok(mut state) => {
                state.set_editor(id, None);
                state.seen.remove(id);
            }
            Err(e) => tracing::warn!(display_id = %id, error = %e, "Failed to release console editor"),
        }
        tracing::debug!(display_id = %id, "Detached disposed display");
    }

    async fn teardown(&self) {
        let displays = self.displays.clear();
        match self.state.lock().await {
            Ok(mut state) => {
                for (_, editor) in state.editors.drain() {
                    editor.close();
                }
                state.seen.clear();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to release console editors"),
        }
        tracing::debug!(displays = displays.len(), "Console closed");
    }
}

/// Repaint the prompt on each display, touching only rows at or below the
/// last painted prompt row or inside the viewport.
async fn sync_buffer(state: &mut ConsoleState, displays: &[Arc<dyn TerminalDisplay>]) {
    let value = state.buffer.value().clone();
    let writes = displays.iter().map(|display| {
        let id = display.id();
        let editor = state.editors.get(&id);
        let size = display.size();
        let start_x = editor.map_or(0, |e| e.start_x);
        let layout = value.layout(size.cols, start_x);

        let base_y = display.base_y();
        let start_base_y = editor
            .and_then(|e| e.start_y_marker.as_ref())
            .and_then(Marker::line)
            .unwrap_or(base_y);
        // Clamped so a shrinking buffer repaints from a row that still exists.
        let last_render_end_y = editor.map_or(0, |e| e.render_end_y).min(layout.rows - 1);
        let render_rows = layout.rows.min(usize::from(size.rows).max(1));
        let render_start_y = layout.rows - render_rows;
        let prerender_start_y = (start_base_y + last_render_end_y) as isize - base_y as isize;
        let skip = (-prerender_start_y).max(0) as usize;
        let first_up = render_rows - 1;
        let (cursor_x, cursor_y) = layout.cursor;
        let second_up = layout.rows - 1 - cursor_y;

        let mut out = String::new();
        out.push_str(&cursor_position(
            (1 + prerender_start_y + skip as isize) as usize,
            1 + if last_render_end_y > 0 { 0 } else { layout.start_x },
        ));
        out.push_str(&erase_display(Erase::Below));
        let from = (last_render_end_y + skip).min(layout.rows);
        out.push_str(&layout.lines[from..].join(CRLF));
        out.push_str(&cursor_column(
            1 + if render_start_y > 0 { 0 } else { layout.start_x },
        ));
        if first_up > 0 {
            out.push_str(&cursor_up(first_up));
        }
        out.push_str(&erase_display(Erase::Below));
        out.push_str(&layout.lines[render_start_y..].join(CRLF));
        out.push_str(&cursor_column(
            1 + if cursor_y < render_start_y { 0 } else { cursor_x },
        ));
        if second_up > 0 {
            out.push_str(&cursor_up(second_up));
        }

        let display = Arc::clone(display);
        let render_end_y = layout.rows - 1;
        async move {
            let result = display.write(out.as_bytes()).await;
            (id, render_end_y, result)
        }
    });

    for (id, render_end_y, result) in join_all(writes).await {
        match result {
            Ok(()) => {
                if let Some(editor) = state.editors.get_mut(&id) {
                    editor.render_end_y = render_end_y;
                }
            }
            Err(e) => tracing::debug!(display_id = %id, error = %e, "Failed to repaint prompt"),
        }
    }
}

/// Keys the console reacts to, for key events without modifiers.
enum Action {
    Evaluate,
    History { backwards: bool },
}

fn action_for(event: &KeyEvent) -> Option<Action> {
    if !event.modifiers.is_empty() {
        return None;
    }
    match event.key {
        Key::Enter => Some(Action::Evaluate),
        Key::ArrowUp => Some(Action::History { backwards: true }),
        Key::ArrowDown => Some(Action::History { backwards: false }),
        _ => None,
    }
}

/// Handle one display's input until it is disposed or the session ends.
async fn drive_display(
    inner: Weak<Inner>,
    display: Arc<dyn TerminalDisplay>,
    mut events: broadcast::Receiver<DisplayEvent>,
    exit: ExitWaiter,
) {
    let display_id = display.id();
    let mut exited = exit.into_future();
    // Set after a handled key so the data it produces is not typed.
    let mut block = false;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut exited => return,
        };
        let Some(this) = inner.upgrade() else {
            return;
        };
        let result = match event {
            Ok(DisplayEvent::Data(data)) => {
                if std::mem::take(&mut block) {
                    continue;
                }
                this.input(&data).await
            }
            Ok(DisplayEvent::Key(key)) => match action_for(&key) {
                Some(Action::Evaluate) => match this.submit().await {
                    Ok(code) => {
                        block = true;
                        let this = Arc::clone(&this);
                        tokio::spawn(async move { this.evaluate(code).await });
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                Some(Action::History { backwards }) => this.navigate(backwards).await.map(|handled| {
                    block = handled;
                }),
                None => Ok(()),
            },
            Ok(DisplayEvent::Resize(_)) => this.reflow(&display).await,
            Ok(DisplayEvent::Disposed) | Err(RecvError::Closed) => {
                this.detach(&display_id).await;
                return;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(display_id = %display_id, skipped, "Console input lagged");
                Ok(())
            }
        };
        if let Err(e) = result {
            this.log.publish(LogRecord::error(e.to_string()));
        }
    }
}

/// Write published log events into the session until it ends.
async fn tail_log(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<Arc<LogEntry>>,
    exit: ExitWaiter,
) {
    let mut exited = exit.into_future();
    loop {
        let received = tokio::select! {
            received = events.recv() => received,
            _ = &mut exited => break,
        };
        let Some(this) = inner.upgrade() else {
            return;
        };
        let entries = match received {
            Ok(entry) => vec![entry],
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Console fell behind the log, replaying history");
                this.log.history()
            }
            Err(RecvError::Closed) => break,
        };
        if let Err(e) = this.flush(&entries).await {
            tracing::warn!(error = %e, "Failed to write log events");
        }
    }
    if let Some(this) = inner.upgrade() {
        this.teardown().await;
    }
}

/// A session showing the log with a script prompt underneath.
pub struct DeveloperConsolePseudoterminal {
    inner: Arc<Inner>,
}

impl DeveloperConsolePseudoterminal {
    /// Create a console over `log`. Must be called inside a Tokio runtime.
    pub fn new(log: LogStream) -> Self {
        Self::with_options(log, ConsoleOptions::default())
    }

    pub fn with_options(log: LogStream, options: ConsoleOptions) -> Self {
        let inner = Arc::new(Inner {
            engine: ScriptEngine::spawn(log.clone(), options.eval_timeout),
            formatter: LogFormatter::new(options.depth),
            displays: AttachedDisplays::new(),
            state: SyncLock::with_max_pending(ConsoleState::default(), options.max_pending),
            exit: Latch::new(),
            log,
        });
        tokio::spawn(tail_log(
            Arc::downgrade(&inner),
            inner.log.listen(),
            inner.exit.outcome(),
        ));
        Self { inner }
    }

    /// The stream this console tails.
    pub fn log(&self) -> &LogStream {
        &self.inner.log
    }

    /// Submitted inputs, oldest first, ending with the current draft.
    pub async fn history(&self) -> Result<Vec<String>> {
        Ok(self.inner.state.lock().await?.history.entries().to_vec())
    }

    /// Current inspection depth.
    pub fn depth(&self) -> u32 {
        self.inner.formatter.depth()
    }

    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.inner.displays.ids()
    }

    /// Evaluate `code` as if it had been typed and submitted.
    pub async fn evaluate(&self, code: impl Into<String>) {
        self.inner.evaluate(code.into()).await;
    }
}

impl std::fmt::Debug for DeveloperConsolePseudoterminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeveloperConsolePseudoterminal")
            .field("displays", &self.inner.displays.len())
            .field("exited", &self.inner.exit.is_set())
            .finish()
    }
}

#[async_trait]
impl Pseudoterminal for DeveloperConsolePseudoterminal {
    async fn kill(&self) -> Result<()> {
        if self.inner.exit.set(Ok(EXIT_SUCCESS)) {
            self.inner.teardown().await;
        }
        Ok(())
    }

    fn on_exit(&self) -> ExitWaiter {
        self.inner.exit.outcome()
    }

    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()> {
        if self.inner.exit.is_set() {
            return Err(PseudoterminalError::Exited);
        }
        if !self.inner.displays.attach(Arc::clone(&display)) {
            return Ok(());
        }
        tokio::spawn(drive_display(
            Arc::downgrade(&self.inner),
            Arc::clone(&display),
            display.subscribe(),
            self.inner.exit.outcome(),
        ));

        let mut state = self.inner.state.lock().await?;
        let history = self.inner.log.history();
        self.inner
            .write(&mut state, &history, std::slice::from_ref(&display))
            .await;
        Ok(())
    }
}
