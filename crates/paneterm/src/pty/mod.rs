//! Pseudoterminal sessions.
//!
//! A [`Pseudoterminal`] is one interactive program attached to zero or more
//! [`TerminalDisplay`]s. Backends:
//!
//! - [`TextPseudoterminal`]: static, replaceable content with no process.
//! - [`DeveloperConsolePseudoterminal`]: log tail plus a script REPL.
//! - [`UnixPseudoterminal`]: a shell behind a helper-owned pty.
//! - [`WindowsPseudoterminal`]: a shell behind a generated batch script.
//!
//! [`RefPseudoterminal`] shares one session between several views.

pub mod process;
pub mod shared;
pub mod text;
pub mod unix;
pub mod windows;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::ExitStatus;

use crate::console::DeveloperConsolePseudoterminal;
use crate::display::TerminalDisplay;
use crate::error::{PseudoterminalError, Result};
use crate::spawn::ProcessSpawner;
use crate::sync::Outcome;

pub use process::{OutputSubscription, ShellProcess, StderrMode};
pub use shared::RefPseudoterminal;
pub use text::TextPseudoterminal;
pub use unix::UnixPseudoterminal;
pub use windows::WindowsPseudoterminal;

/// Resolves with the session's process once it has started.
pub type ShellFuture = Outcome<Arc<ShellProcess>>;

/// Resolves with the session's exit descriptor.
pub type ExitWaiter = Outcome<ExitStatus>;

/// Default interval between resizer keep-alives.
pub const RESIZER_WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

/// Default delay before exit-code capture files are removed.
pub const EXIT_CLEANUP_WAIT: Duration = Duration::from_secs(10);

/// Default number of cleanup attempts after the first fails.
pub const EXIT_CLEANUP_RETRIES: u32 = 3;

/// A session attached to terminal displays.
#[async_trait]
pub trait Pseudoterminal: Send + Sync {
    /// The underlying process, for sessions that have one.
    fn shell(&self) -> Option<ShellFuture> {
        None
    }

    /// Terminate the session.
    async fn kill(&self) -> Result<()>;

    /// Resolves exactly once with the exit descriptor.
    fn on_exit(&self) -> ExitWaiter;

    /// Attach a display: output flows into it and its input flows back.
    ///
    /// Rejected with [`PseudoterminalError::Exited`] once the session has
    /// settled. Shells that exited with output no display has seen yet
    /// accept one more display and replay it.
    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()>;

    /// Resize the session's terminal.
    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Err(PseudoterminalError::ResizeUnsupported)
    }
}

#[async_trait]
impl<T: Pseudoterminal + ?Sized> Pseudoterminal for Arc<T> {
    fn shell(&self) -> Option<ShellFuture> {
        (**self).shell()
    }

    async fn kill(&self) -> Result<()> {
        (**self).kill().await
    }

    fn on_exit(&self) -> ExitWaiter {
        (**self).on_exit()
    }

    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()> {
        (**self).pipe(display).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        (**self).resize(cols, rows).await
    }
}

/// Construction parameters for shell sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellPseudoterminalArguments {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Interpreter for the helper scripts. Enables resizing.
    pub python_executable: Option<String>,
    /// Run under the Windows console host.
    pub use_win32_conhost: bool,
    /// Value for `TERM`.
    pub terminal: Option<String>,
}

impl ShellPseudoterminalArguments {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }
}

/// Timing knobs for shell backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyTiming {
    pub resizer_watchdog_interval: Duration,
    pub exit_cleanup_wait: Duration,
    pub exit_cleanup_retries: u32,
}

impl Default for PtyTiming {
    fn default() -> Self {
        Self {
            resizer_watchdog_interval: RESIZER_WATCHDOG_INTERVAL,
            exit_cleanup_wait: EXIT_CLEANUP_WAIT,
            exit_cleanup_retries: EXIT_CLEANUP_RETRIES,
        }
    }
}

/// Every session kind.
pub enum AnyPseudoterminal {
    Text(TextPseudoterminal),
    DeveloperConsole(DeveloperConsolePseudoterminal),
    Unix(UnixPseudoterminal),
    Windows(WindowsPseudoterminal),
}

impl AnyPseudoterminal {
    fn inner(&self) -> &dyn Pseudoterminal {
        match self {
            AnyPseudoterminal::Text(pty) => pty,
            AnyPseudoterminal::DeveloperConsole(pty) => pty,
            AnyPseudoterminal::Unix(pty) => pty,
            AnyPseudoterminal::Windows(pty) => pty,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnyPseudoterminal::Text(_) => "text",
            AnyPseudoterminal::DeveloperConsole(_) => "developer-console",
            AnyPseudoterminal::Unix(_) => "unix",
            AnyPseudoterminal::Windows(_) => "windows",
        }
    }
}

impl fmt::Debug for AnyPseudoterminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyPseudoterminal").field(&self.kind()).finish()
    }
}

#[async_trait]
impl Pseudoterminal for AnyPseudoterminal {
    fn shell(&self) -> Option<ShellFuture> {
        self.inner().shell()
    }

    async fn kill(&self) -> Result<()> {
        self.inner().kill().await
    }

    fn on_exit(&self) -> ExitWaiter {
        self.inner().on_exit()
    }

    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()> {
        self.inner().pipe(display).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.inner().resize(cols, rows).await
    }
}

impl From<TextPseudoterminal> for AnyPseudoterminal {
    fn from(pty: TextPseudoterminal) -> Self {
        AnyPseudoterminal::Text(pty)
    }
}

impl From<DeveloperConsolePseudoterminal> for AnyPseudoterminal {
    fn from(pty: DeveloperConsolePseudoterminal) -> Self {
        AnyPseudoterminal::DeveloperConsole(pty)
    }
}

impl From<UnixPseudoterminal> for AnyPseudoterminal {
    fn from(pty: UnixPseudoterminal) -> Self {
        AnyPseudoterminal::Unix(pty)
    }
}

impl From<WindowsPseudoterminal> for AnyPseudoterminal {
    fn from(pty: WindowsPseudoterminal) -> Self {
        AnyPseudoterminal::Windows(pty)
    }
}

/// Host platform identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Darwin,
    Linux,
    Win32,
    Other,
}

impl Platform {
    /// The platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(windows) {
            Platform::Win32
        } else {
            Platform::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
            Platform::Win32 => "win32",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "darwin" | "macos" => Platform::Darwin,
            "linux" => Platform::Linux,
            "win32" | "windows" => Platform::Win32,
            _ => Platform::Other,
        })
    }
}

/// Shell backend constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellBackend {
    Unix,
    Windows,
}

impl ShellBackend {
    /// Start a shell session. Never blocks; spawning happens on a task.
    pub fn open(
        self,
        args: ShellPseudoterminalArguments,
        spawner: Arc<dyn ProcessSpawner>,
        timing: PtyTiming,
    ) -> AnyPseudoterminal {
        match self {
            ShellBackend::Unix => UnixPseudoterminal::new(args, spawner).into(),
            ShellBackend::Windows => WindowsPseudoterminal::new(args, spawner, timing).into(),
        }
    }
}

/// Backend for a platform, or `None` where shells are unsupported.
pub fn platform_backend(platform: Platform) -> Option<ShellBackend> {
    match platform {
        Platform::Darwin | Platform::Linux => Some(ShellBackend::Unix),
        Platform::Win32 => Some(ShellBackend::Windows),
        Platform::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::testing::FakeSpawner;

    #[test]
    fn test_platform_dispatch() {
        assert_eq!(platform_backend(Platform::Darwin), Some(ShellBackend::Unix));
        assert_eq!(platform_backend(Platform::Linux), Some(ShellBackend::Unix));
        assert_eq!(platform_backend(Platform::Win32), Some(ShellBackend::Windows));
        assert_eq!(platform_backend(Platform::Other), None);
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert_eq!("Win32".parse::<Platform>().unwrap(), Platform::Win32);
        assert_eq!("darwin".parse::<Platform>().unwrap(), Platform::Darwin);
        assert_eq!("freebsd".parse::<Platform>().unwrap(), Platform::Other);
        assert_eq!(Platform::Win32.to_string(), "win32");
    }

    #[test]
    fn test_current_platform_has_backend() {
        if cfg!(any(target_os = "linux", target_os = "macos", windows)) {
            assert!(platform_backend(Platform::current()).is_some());
        }
    }

    #[tokio::test]
    async fn test_open_dispatches_to_backend() {
        let (spawner, mut processes) = FakeSpawner::new();
        let pty = ShellBackend::Unix.open(
            ShellPseudoterminalArguments::new("/bin/sh"),
            spawner.clone(),
            PtyTiming::default(),
        );
        assert_eq!(pty.kind(), "unix");
        let fake = processes.recv().await.unwrap();
        assert_eq!(fake.command.program, "/bin/sh");
    }

    #[test]
    fn test_default_timing() {
        let timing = PtyTiming::default();
        assert_eq!(timing.resizer_watchdog_interval, Duration::from_millis(500));
        assert_eq!(timing.exit_cleanup_wait, Duration::from_secs(10));
        assert_eq!(timing.exit_cleanup_retries, 3);
    }
}
