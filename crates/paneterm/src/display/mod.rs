//! The terminal display surface sessions render into.
//!
//! A display is an external widget: it accepts output bytes, reports its
//! size and cursor, anchors line markers, and emits input events. Sessions
//! only ever see it through [`TerminalDisplay`].

mod virtual_display;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use protocol::control::{cursor_position, erase_display, Erase, CRLF};
use protocol::TerminalSize;
use tokio::sync::broadcast;

use crate::error::DisplayError;

pub use virtual_display::{VirtualDisplay, DEFAULT_SCROLLBACK_LINES};

/// Unique identifier for a display.
pub type DisplayId = String;

/// Channel capacity for display events.
pub const EVENT_CAPACITY: usize = 256;

/// Keys the sessions react to. Anything else arrives as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Enter,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    Backspace,
    Delete,
    Home,
    End,
    Tab,
    Escape,
    Char(char),
    Other(String),
}

/// Modifier keys held during a key press.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Modifiers {
    pub alt: bool,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        alt: false,
        ctrl: false,
        meta: false,
        shift: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// A key press as reported by the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    /// A key press with no modifiers.
    pub fn plain(key: Key) -> Self {
        Self {
            key,
            modifiers: Modifiers::NONE,
        }
    }
}

/// Input and lifecycle events emitted by a display.
///
/// A key press is reported as `Key` followed by the `Data` it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    Data(String),
    Key(KeyEvent),
    Resize(TerminalSize),
    Disposed,
}

/// A line anchor registered on a display's buffer.
///
/// The display keeps the anchor on the same content as the buffer scrolls.
/// A disposed marker reports no line.
#[derive(Debug, Clone)]
pub struct Marker {
    state: Arc<MarkerState>,
}

#[derive(Debug)]
struct MarkerState {
    line: AtomicUsize,
    disposed: AtomicBool,
}

impl Marker {
    /// Create a marker at an absolute buffer line.
    pub fn new(line: usize) -> Self {
        Self {
            state: Arc::new(MarkerState {
                line: AtomicUsize::new(line),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Absolute buffer line, or `None` once disposed.
    pub fn line(&self) -> Option<usize> {
        if self.is_disposed() {
            None
        } else {
            Some(self.state.line.load(Ordering::SeqCst))
        }
    }

    /// Move the anchor (used by displays when their buffer is trimmed).
    pub fn set_line(&self, line: usize) {
        self.state.line.store(line, Ordering::SeqCst);
    }

    pub fn dispose(&self) {
        self.state.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }
}

/// A terminal widget that sessions write to and read input from.
#[async_trait]
pub trait TerminalDisplay: Send + Sync {
    /// Stable identifier of this display.
    fn id(&self) -> DisplayId;

    /// Write output bytes, resolving once they are applied.
    async fn write(&self, data: &[u8]) -> Result<(), DisplayError>;

    /// Size in cells.
    fn size(&self) -> TerminalSize;

    /// Cursor `(x, y)` relative to the viewport.
    fn cursor(&self) -> (u16, u16);

    /// Absolute buffer line shown at the top of the viewport.
    fn base_y(&self) -> usize;

    /// Register a marker on the cursor line. `None` if the display cannot.
    fn register_marker(&self) -> Option<Marker>;

    /// Subscribe to input events.
    fn subscribe(&self) -> broadcast::Receiver<DisplayEvent>;

    fn is_disposed(&self) -> bool;
}

/// Clear a display and home the cursor.
///
/// With `keep`, the visible contents are first scrolled into the
/// scrollback so they stay reachable.
pub async fn clear_display(display: &dyn TerminalDisplay, keep: bool) -> Result<(), DisplayError> {
    let mut seq = String::new();
    if keep {
        let rows = usize::from(display.size().rows);
        seq.push_str(&CRLF.repeat(rows.saturating_sub(1)));
        seq.push_str(&erase_display(Erase::All));
    } else {
        seq.push_str(&erase_display(Erase::All));
        seq.push_str(&erase_display(Erase::Scrollback));
    }
    seq.push_str(&cursor_position(1, 1));
    display.write(seq.as_bytes()).await
}

/// The set of displays a session is currently rendering into.
#[derive(Default)]
pub struct AttachedDisplays {
    displays: Mutex<Vec<Arc<dyn TerminalDisplay>>>,
}

impl AttachedDisplays {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn TerminalDisplay>>> {
        self.displays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a display. Returns `false` if it was already attached.
    pub fn attach(&self, display: Arc<dyn TerminalDisplay>) -> bool {
        let mut displays = self.lock();
        let id = display.id();
        if displays.iter().any(|d| d.id() == id) {
            return false;
        }
        displays.push(display);
        true
    }

    /// Detach a display by id.
    pub fn detach(&self, id: &str) -> Option<Arc<dyn TerminalDisplay>> {
        let mut displays = self.lock();
        let index = displays.iter().position(|d| d.id() == id)?;
        Some(displays.remove(index))
    }

    /// Detach everything, returning what was attached.
    pub fn clear(&self) -> Vec<Arc<dyn TerminalDisplay>> {
        std::mem::take(&mut *self.lock())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn TerminalDisplay>> {
        self.lock().clone()
    }

    pub fn ids(&self) -> Vec<DisplayId> {
        self.lock().iter().map(|d| d.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
