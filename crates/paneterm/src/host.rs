//! The host terminal as a [`TerminalDisplay`].
//!
//! Output is mirrored into a [`VirtualDisplay`] so cursor, size and
//! scrollback queries are answered locally, then forwarded to the real
//! terminal. Input is read with crossterm on a blocking thread.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use protocol::TerminalSize;
use tokio::sync::{broadcast, oneshot};

use crate::display::{
    DisplayEvent, DisplayId, Key, KeyEvent, Marker, Modifiers, TerminalDisplay, VirtualDisplay,
};
use crate::error::DisplayError;

/// How long the input thread waits for an event before checking for stop.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why the input loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    /// The user pressed the detach key (Ctrl+]).
    Detached,
    /// The loop was asked to stop.
    Stopped,
}

type SharedWriter = Mutex<Box<dyn Write + Send>>;

/// A display backed by the process's own terminal.
pub struct HostDisplay {
    mirror: VirtualDisplay,
    out: SharedWriter,
}

impl HostDisplay {
    /// A display writing to stdout, sized like the current terminal.
    pub fn stdout() -> io::Result<Self> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(Self::with_writer(cols, rows, Box::new(io::stdout())))
    }

    /// A display writing to `out`.
    pub fn with_writer(cols: u16, rows: u16, out: Box<dyn Write + Send>) -> Self {
        Self {
            mirror: VirtualDisplay::new(cols, rows),
            out: Mutex::new(out),
        }
    }

    /// Deliver a translated host event to subscribers.
    pub fn dispatch(&self, event: DisplayEvent) {
        match event {
            DisplayEvent::Data(data) => self.mirror.input(&data),
            DisplayEvent::Key(key) => self.mirror.press(key, ""),
            DisplayEvent::Resize(size) => self.mirror.resize(size.cols, size.rows),
            DisplayEvent::Disposed => self.mirror.dispose(),
        }
    }

    /// Mark the display gone. Sessions detach on the resulting event.
    pub fn dispose(&self) {
        self.mirror.dispose();
    }
}

#[async_trait]
impl TerminalDisplay for HostDisplay {
    fn id(&self) -> DisplayId {
        self.mirror.id()
    }

    async fn write(&self, data: &[u8]) -> Result<(), DisplayError> {
        self.mirror.write(data).await?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(data)?;
        out.flush()?;
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.mirror.size()
    }

    fn cursor(&self) -> (u16, u16) {
        self.mirror.cursor()
    }

    fn base_y(&self) -> usize {
        self.mirror.base_y()
    }

    fn register_marker(&self) -> Option<Marker> {
        self.mirror.register_marker()
    }

    fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.mirror.subscribe()
    }

    fn is_disposed(&self) -> bool {
        self.mirror.is_disposed()
    }
}

/// Raw mode and the alternate screen, restored on drop.
pub struct RawTerminal {
    restored: bool,
}

impl RawTerminal {
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(Self { restored: false })
    }

    pub fn restore(&mut self) -> io::Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        disable_raw_mode()?;
        execute!(io::stdout(), LeaveAlternateScreen)?;
        Ok(())
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = self.restore();
    }
}

/// Handle to the thread feeding host input into a [`HostDisplay`].
pub struct InputPump {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<InputEnd>,
}

impl InputPump {
    /// Start reading host events into `display`.
    pub fn spawn(display: Arc<HostDisplay>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, done) = oneshot::channel();
        let flag = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            let end = pump(&display, &flag).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read terminal input");
                InputEnd::Stopped
            });
            let _ = tx.send(end);
        });
        Self { stop, done }
    }

    /// Resolves when the loop ends on its own.
    pub async fn finished(&mut self) -> InputEnd {
        (&mut self.done).await.unwrap_or(InputEnd::Stopped)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for InputPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump(display: &HostDisplay, stop: &AtomicBool) -> io::Result<InputEnd> {
    while !stop.load(Ordering::SeqCst) {
        if !event::poll(INPUT_POLL_INTERVAL)? {
            continue;
        }
        match event::read()? {
            Event::Key(key) if key.kind != KeyEventKind::Release => {
                if is_detach(&key) {
                    return Ok(InputEnd::Detached);
                }
                let (key, data) = translate_key(&key);
                display.dispatch(DisplayEvent::Key(key));
                if !data.is_empty() {
                    display.dispatch(DisplayEvent::Data(data));
                }
            }
            Event::Paste(text) => display.dispatch(DisplayEvent::Data(text)),
            Event::Resize(cols, rows) => {
                display.dispatch(DisplayEvent::Resize(TerminalSize::new(cols, rows)))
            }
            _ => {}
        }
    }
    Ok(InputEnd::Stopped)
}

/// Ctrl+] returns control to the host.
pub fn is_detach(key: &event::KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']')
}

/// Map a crossterm key press to the display's key event and the bytes a
/// terminal would send for it.
pub fn translate_key(key: &event::KeyEvent) -> (KeyEvent, String) {
    let modifiers = Modifiers {
        alt: key.modifiers.contains(KeyModifiers::ALT),
        ctrl: key.modifiers.contains(KeyModifiers::CONTROL),
        meta: key.modifiers.contains(KeyModifiers::SUPER)
            || key.modifiers.contains(KeyModifiers::META),
        shift: key.modifiers.contains(KeyModifiers::SHIFT),
    };
    let (code, data) = match key.code {
        KeyCode::Enter => (Key::Enter, "\r".to_string()),
        KeyCode::Up => (Key::ArrowUp, "\x1b[A".to_string()),
        KeyCode::Down => (Key::ArrowDown, "\x1b[B".to_string()),
        KeyCode::Right => (Key::ArrowRight, "\x1b[C".to_string()),
        KeyCode::Left => (Key::ArrowLeft, "\x1b[D".to_string()),
        KeyCode::Backspace => (Key::Backspace, "\x7f".to_string()),
        KeyCode::Delete => (Key::Delete, "\x1b[3~".to_string()),
        KeyCode::Home => (Key::Home, "\x1b[H".to_string()),
        KeyCode::End => (Key::End, "\x1b[F".to_string()),
        KeyCode::Tab => (Key::Tab, "\t".to_string()),
        KeyCode::BackTab => (Key::Tab, "\x1b[Z".to_string()),
        KeyCode::Esc => (Key::Escape, "\x1b".to_string()),
        KeyCode::Char(c) => (Key::Char(c), char_data(c, modifiers)),
        other => (Key::Other(format!("{other:?}")), String::new()),
    };
    (
        KeyEvent {
            key: code,
            modifiers,
        },
        data,
    )
}

fn char_data(c: char, modifiers: Modifiers) -> String {
    let mut data = String::new();
    if modifiers.alt {
        data.push('\x1b');
    }
    if modifiers.ctrl && c.is_ascii_alphabetic() {
        data.push(char::from(c.to_ascii_lowercase() as u8 & 0x1f));
    } else {
        data.push(c);
    }
    data
}
