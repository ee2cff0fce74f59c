//! POSIX shell sessions.
//!
//! With an interpreter configured the shell runs under a small helper
//! script that owns a real pty and accepts resize frames on descriptor 3.
//! Without one the shell is spawned directly over pipes and cannot be
//! resized.

use std::sync::Arc;

use async_trait::async_trait;
use protocol::{ExitStatus, TerminalSize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::process::{pipe_process, ShellProcess, StderrMode};
use super::{ExitWaiter, Pseudoterminal, ShellFuture, ShellPseudoterminalArguments};
use crate::display::TerminalDisplay;
use crate::error::{PseudoterminalError, Result};
use crate::spawn::{BoxedWriter, ProcessSpawner, SpawnCommand};
use crate::sync::{Latch, OutcomeLatch};

/// Helper run by the interpreter.
pub const UNIX_PSEUDOTERMINAL_PY: &str = include_str!("../../assets/unix_pseudoterminal.py");

/// Encoding forced on the helper's standard streams.
pub const PYTHONIOENCODING: &str = "utf-8:backslashreplace";

struct Session {
    shell: OutcomeLatch<Arc<ShellProcess>>,
    exit: OutcomeLatch<ExitStatus>,
    /// Write end of the helper's resize channel while it runs.
    control: Mutex<Option<BoxedWriter>>,
    resizable: bool,
}

/// A shell on a POSIX host.
pub struct UnixPseudoterminal {
    session: Arc<Session>,
}

impl UnixPseudoterminal {
    /// Start the shell. Must be called inside a Tokio runtime.
    pub fn new(args: ShellPseudoterminalArguments, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let command = Self::command(&args);
        let session = Arc::new(Session {
            shell: Latch::new(),
            exit: Latch::new(),
            control: Mutex::new(None),
            resizable: command.control_channel,
        });

        tokio::spawn(run(Arc::clone(&session), command, spawner));
        Self { session }
    }

    /// The process to spawn for `args`.
    pub fn command(args: &ShellPseudoterminalArguments) -> SpawnCommand {
        let command = match args.python_executable {
            Some(ref python) => SpawnCommand::new(python.clone())
                .arg("-c")
                .arg(UNIX_PSEUDOTERMINAL_PY)
                .arg(args.executable.clone())
                .args(args.args.iter().cloned())
                .env("PYTHONIOENCODING", PYTHONIOENCODING)
                .control_channel(true),
            None => SpawnCommand::new(args.executable.clone()).args(args.args.iter().cloned()),
        };
        let command = match args.terminal {
            Some(ref terminal) => command.env("TERM", terminal.clone()),
            None => command,
        };
        command.cwd(args.cwd.clone())
    }
}

async fn run(session: Arc<Session>, command: SpawnCommand, spawner: Arc<dyn ProcessSpawner>) {
    let program = command.program.clone();
    let stderr = if command.control_channel {
        StderrMode::MergeAndLog
    } else {
        StderrMode::Merge
    };

    let mut spawned = match spawner.spawn(command) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "Failed to start shell");
            session.shell.set(Err(e.clone()));
            session.exit.set(Err(e));
            return;
        }
    };

    *session.control.lock().await = spawned.control.take();
    let process = ShellProcess::start(spawned, stderr);
    session.shell.set(Ok(Arc::clone(&process)));
    tracing::info!(program = %program, pid = ?process.pid(), "Shell started");

    let status = process.exited().wait().await.unwrap_or(ExitStatus::Unknown);
    session.control.lock().await.take();
    session.exit.set(Ok(status));
}

#[async_trait]
impl Pseudoterminal for UnixPseudoterminal {
    fn shell(&self) -> Option<ShellFuture> {
        Some(self.session.shell.outcome())
    }

    async fn kill(&self) -> Result<()> {
        let process = self.session.shell.outcome().await?;
        process.kill().await
    }

    fn on_exit(&self) -> ExitWaiter {
        self.session.exit.outcome()
    }

    async fn pipe(&self, display: Arc<dyn TerminalDisplay>) -> Result<()> {
        let process = self.session.shell.outcome().await?;
        // Output printed before the first display attached is replayed
        // even after exit.
        if self.session.exit.is_set() && process.output_claimed() {
            return Err(PseudoterminalError::Exited);
        }
        pipe_process(process, display, self.session.exit.outcome(), false).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if !self.session.resizable {
            return Err(PseudoterminalError::ResizerDisabled);
        }
        self.session.shell.outcome().await?;

        let mut control = self.session.control.lock().await;
        let writer = control
            .as_mut()
            .ok_or(PseudoterminalError::ResizerDisabled)?;
        let frame = TerminalSize::new(cols, rows).to_frame();
        writer
            .write_all(&frame)
            .await
            .map_err(|e| PseudoterminalError::ResizeFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| PseudoterminalError::ResizeFailed(e.to_string()))?;
        tracing::debug!(cols, rows, "Resized shell");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::VirtualDisplay;
    use crate::spawn::testing::FakeSpawner;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn python_args() -> ShellPseudoterminalArguments {
        ShellPseudoterminalArguments {
            executable: "/bin/bash".to_string(),
            args: vec!["-l".to_string()],
            cwd: Some(PathBuf::from("/tmp")),
            python_executable: Some("python3".to_string()),
            use_win32_conhost: false,
            terminal: Some("xterm-256color".to_string()),
        }
    }

    #[test]
    fn test_command_with_interpreter() {
        let command = UnixPseudoterminal::command(&python_args());
        assert_eq!(command.program, "python3");
        assert_eq!(command.args[0], "-c");
        assert_eq!(command.args[1], UNIX_PSEUDOTERMINAL_PY);
        assert_eq!(&command.args[2..], ["/bin/bash", "-l"]);
        assert_eq!(command.env_var("PYTHONIOENCODING"), Some(PYTHONIOENCODING));
        assert_eq!(command.env_var("TERM"), Some("xterm-256color"));
        assert_eq!(command.cwd, Some(PathBuf::from("/tmp")));
        assert!(command.control_channel);
    }

    #[test]
    fn test_command_without_interpreter() {
        let args = ShellPseudoterminalArguments {
            args: vec!["hi".to_string()],
            ..ShellPseudoterminalArguments::new("/bin/echo")
        };
        let command = UnixPseudoterminal::command(&args);
        assert_eq!(command.program, "/bin/echo");
        assert_eq!(command.args, vec!["hi"]);
        assert!(!command.control_channel);
        assert_eq!(command.env_var("PYTHONIOENCODING"), None);
    }

    #[tokio::test]
    async fn test_resize_writes_frame() {
        let (spawner, mut processes) = FakeSpawner::new();
        let pty = UnixPseudoterminal::new(python_args(), spawner);
        let mut fake = processes.recv().await.unwrap();

        pty.resize(120, 40).await.unwrap();
        let control = fake.control.as_mut().unwrap();
        let mut frame = [0u8; 7];
        control.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame, b"120x40\n");
    }

    #[tokio::test]
    async fn test_resize_without_interpreter_rejected() {
        let (spawner, _processes) = FakeSpawner::new();
        let pty = UnixPseudoterminal::new(ShellPseudoterminalArguments::new("/bin/sh"), spawner);
        assert_eq!(
            pty.resize(80, 24).await,
            Err(PseudoterminalError::ResizerDisabled)
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_rejects_shell_and_exit() {
        let (spawner, _processes) = FakeSpawner::new();
        spawner.fail("/missing/shell");
        let pty = UnixPseudoterminal::new(ShellPseudoterminalArguments::new("/missing/shell"), spawner);

        let shell = pty.shell().unwrap().await;
        assert!(matches!(shell, Err(PseudoterminalError::SpawnFailed(_))));
        let exit = pty.on_exit().await;
        assert!(matches!(exit, Err(PseudoterminalError::SpawnFailed(_))));
        assert!(pty.kill().await.is_err());
    }

    #[tokio::test]
    async fn test_exit_and_pipe_after_exit() {
        let (spawner, mut processes) = FakeSpawner::new();
        let pty = UnixPseudoterminal::new(ShellPseudoterminalArguments::new("/bin/sh"), spawner);
        let mut fake = processes.recv().await.unwrap();

        let display = Arc::new(VirtualDisplay::new(20, 4));
        pty.pipe(display.clone()).await.unwrap();
        fake.stdout.write_all(b"$ ").await.unwrap();
        fake.exit(ExitStatus::Code(2));

        let status = tokio::time::timeout(Duration::from_secs(5), pty.on_exit())
            .await
            .unwrap();
        assert_eq!(status, Ok(ExitStatus::Code(2)));
        assert_eq!(
            pty.pipe(display).await,
            Err(PseudoterminalError::Exited)
        );
        assert!(matches!(
            pty.kill().await,
            Err(PseudoterminalError::KillFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_output_replayed_after_exit() {
        let (spawner, mut processes) = FakeSpawner::new();
        let pty = UnixPseudoterminal::new(ShellPseudoterminalArguments::new("/bin/echo"), spawner);
        let mut fake = processes.recv().await.unwrap();

        fake.stdout.write_all(b"hi\r\n").await.unwrap();
        fake.exit(ExitStatus::Code(0));
        assert_eq!(pty.on_exit().await, Ok(ExitStatus::Code(0)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let display = Arc::new(VirtualDisplay::new(20, 4));
        pty.pipe(display.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !display.contents().contains("hi") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            pty.pipe(Arc::new(VirtualDisplay::new(20, 4))).await,
            Err(PseudoterminalError::Exited)
        );
    }

    #[tokio::test]
    async fn test_kill_terminates_process() {
        let (spawner, mut processes) = FakeSpawner::new();
        let pty = UnixPseudoterminal::new(ShellPseudoterminalArguments::new("/bin/sh"), spawner);
        let fake = processes.recv().await.unwrap();

        pty.kill().await.unwrap();
        assert_eq!(
            pty.on_exit().await,
            Ok(ExitStatus::Signal("SIGTERM".to_string()))
        );
        assert_eq!(fake.kills.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            pty.resize(80, 24).await,
            Err(PseudoterminalError::ResizerDisabled)
        ));
    }
}
