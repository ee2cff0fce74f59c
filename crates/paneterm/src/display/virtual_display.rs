//! An in-memory display backed by a `vt100` screen.
//!
//! Used by the test suites and as the mirror behind the host terminal: it
//! keeps an exact model of what a real terminal would show, so cursor and
//! scrollback queries need no round trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use protocol::TerminalSize;
use tokio::sync::broadcast;
use uuid::Uuid;
use vt100::Parser;

use super::{DisplayEvent, DisplayId, KeyEvent, Marker, TerminalDisplay, EVENT_CAPACITY};
use crate::error::DisplayError;

/// Scrollback retained by a virtual display.
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;

/// Narrowest screen modeled. vt100 cannot place a wide character in a
/// single column.
pub const MIN_COLS: u16 = 2;

/// `(rows, cols)` for the parser, clamped to a screen it can model.
fn screen_size(cols: u16, rows: u16) -> (u16, u16) {
    (rows.max(1), cols.max(MIN_COLS))
}

/// A headless terminal display.
pub struct VirtualDisplay {
    id: DisplayId,
    state: Mutex<ScreenState>,
    events: broadcast::Sender<DisplayEvent>,
    disposed: AtomicBool,
}

struct ScreenState {
    parser: Parser,
    /// Every byte ever written, for inspection.
    received: Vec<u8>,
}

impl VirtualDisplay {
    /// Create a display of the given size.
    pub fn new(cols: u16, rows: u16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (rows, cols) = screen_size(cols, rows);
        Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(ScreenState {
                parser: Parser::new(rows, cols, DEFAULT_SCROLLBACK_LINES),
                received: Vec::new(),
            }),
            events,
            disposed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScreenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DisplayEvent) {
        // No subscribers is fine: input typed into an unattached display is lost.
        let _ = self.events.send(event);
    }

    /// Simulate typed or pasted input.
    pub fn input(&self, data: &str) {
        self.emit(DisplayEvent::Data(data.to_string()));
    }

    /// Simulate a key press: the key event, then the data it produces.
    pub fn press(&self, key: KeyEvent, data: &str) {
        self.emit(DisplayEvent::Key(key));
        if !data.is_empty() {
            self.emit(DisplayEvent::Data(data.to_string()));
        }
    }

    /// Resize the screen and notify subscribers.
    pub fn resize(&self, cols: u16, rows: u16) {
        let (screen_rows, screen_cols) = screen_size(cols, rows);
        self.lock().parser.set_size(screen_rows, screen_cols);
        self.emit(DisplayEvent::Resize(TerminalSize::new(cols, rows)));
    }

    /// Dispose the display; writes fail afterwards.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.emit(DisplayEvent::Disposed);
        }
    }

    /// Visible screen contents, rows joined by `\n`.
    pub fn contents(&self) -> String {
        self.lock().parser.screen().contents()
    }

    /// Text of one visible row, trailing blanks removed.
    pub fn row(&self, row: u16) -> String {
        let state = self.lock();
        let screen = state.parser.screen();
        let (_, cols) = screen.size();
        let line = screen
            .rows(0, cols)
            .nth(usize::from(row))
            .map(|line| line.trim_end().to_string())
            .unwrap_or_default();
        line
    }

    /// Everything written so far.
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    /// Everything written so far, decoded lossily.
    pub fn received_text(&self) -> String {
        String::from_utf8_lossy(&self.lock().received).into_owned()
    }
}

#[async_trait]
impl TerminalDisplay for VirtualDisplay {
    fn id(&self) -> DisplayId {
        self.id.clone()
    }

    async fn write(&self, data: &[u8]) -> Result<(), DisplayError> {
        if self.is_disposed() {
            return Err(DisplayError::Disposed);
        }
        let mut state = self.lock();
        state.parser.process(data);
        state.received.extend_from_slice(data);
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        let (rows, cols) = self.lock().parser.screen().size();
        TerminalSize::new(cols, rows)
    }

    fn cursor(&self) -> (u16, u16) {
        let (row, col) = self.lock().parser.screen().cursor_position();
        (col, row)
    }

    fn base_y(&self) -> usize {
        let mut state = self.lock();
        // The scrollback offset is clamped to the lines actually stored.
        state.parser.set_scrollback(usize::MAX);
        let lines = state.parser.screen().scrollback();
        state.parser.set_scrollback(0);
        lines
    }

    fn register_marker(&self) -> Option<Marker> {
        if self.is_disposed() {
            return None;
        }
        let (_, y) = self.cursor();
        Some(Marker::new(self.base_y() + usize::from(y)))
    }

    fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.events.subscribe()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
