//! # Paneterm
//!
//! Pseudoterminal sessions for terminal panes: shells, static text and a
//! developer console, all rendered into displays that implement
//! [`TerminalDisplay`].
//!
//! ## Overview
//!
//! - **Sessions**: the [`Pseudoterminal`] contract and its backends
//! - **Sharing**: [`RefPseudoterminal`] lets several views hold one session
//!   and kills it when the last view goes away
//! - **Line Editing**: [`TerminalTextArea`] keeps an editable buffer with a
//!   cursor and lays it out for a given width
//! - **Developer Console**: tails the [`LogStream`] and evaluates scripts
//!   typed at its prompt
//! - **Host Terminal**: [`host::HostDisplay`] drives the process's own tty
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TerminalDisplay(s)                       │
//! │        VirtualDisplay · HostDisplay · embedder widgets       │
//! └───────────────▲──────────────────────────────┬───────────────┘
//!                 │ output                 input │ events
//! ┌───────────────┴──────────────────────────────▼───────────────┐
//! │                 RefPseudoterminal (optional)                 │
//! ├──────────────┬──────────────────┬──────────────┬─────────────┤
//! │     Text     │ DeveloperConsole │     Unix     │   Windows   │
//! │              │  LogStream + JS  │ pty helper   │ batch + cmd │
//! └──────────────┴──────────────────┴──────┬───────┴──────┬──────┘
//!                                          │  ProcessSpawner
//!                                          ▼              ▼
//!                                       child processes
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use paneterm::pty::{platform_backend, Platform, PtyTiming, ShellPseudoterminalArguments};
//! use paneterm::{Pseudoterminal, TokioSpawner, VirtualDisplay};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = platform_backend(Platform::current())
//!         .ok_or_else(|| anyhow::anyhow!("unsupported platform"))?;
//!     let pty = backend.open(
//!         ShellPseudoterminalArguments::new("/bin/echo"),
//!         Arc::new(TokioSpawner),
//!         PtyTiming::default(),
//!     );
//!
//!     let display = Arc::new(VirtualDisplay::new(80, 24));
//!     pty.pipe(display.clone()).await?;
//!     let status = pty.on_exit().await?;
//!     println!("exited with {status}");
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`pty`]: Session contract and backends
//! - [`console`]: Developer console
//! - [`text`]: Line-editor buffer
//! - [`display`]: Display surface and the in-memory display
//! - [`spawn`]: Process spawning seam
//! - [`sync`]: Latches and the bounded session lock
//! - [`logging`]: Log stream and subscriber setup
//! - [`config`]: Configuration file handling
//! - [`host`]: The host terminal as a display
//! - [`error`]: Error types

pub mod config;
pub mod console;
pub mod display;
pub mod error;
pub mod host;
pub mod logging;
pub mod pty;
pub mod spawn;
pub mod sync;
pub mod text;

pub use config::{Config, ConfigError};
pub use console::{ConsoleOptions, DeveloperConsolePseudoterminal};
pub use display::{
    clear_display, DisplayEvent, Key, KeyEvent, Marker, Modifiers, TerminalDisplay,
    VirtualDisplay,
};
pub use error::{DisplayError, PseudoterminalError, Result};
pub use logging::LogStream;
pub use pty::{
    AnyPseudoterminal, Platform, Pseudoterminal, RefPseudoterminal, ShellBackend,
    ShellPseudoterminalArguments, TextPseudoterminal, UnixPseudoterminal, WindowsPseudoterminal,
};
pub use spawn::{ProcessSpawner, TokioSpawner};
pub use text::{CursoredText, TerminalTextArea};

pub use protocol::{ExitStatus, EXIT_SUCCESS};
