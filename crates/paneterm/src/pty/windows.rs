//! Windows shell sessions.
//!
//! The console host rewrites quoted arguments, so the command line is
//! written to a generated batch script instead. The script also records
//! the command's exit code in a capture file, since a wrapped console
//! application's own code is not reported through the wrapper's exit.
//!
//! With an interpreter configured, a companion resizer process attaches to
//! the shell's console and applies `"<cols>x<rows>"` frames.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::{encode_pid_frame, ExitStatus, TerminalSize, KEEP_ALIVE_FRAME};

use super::process::{pipe_process, ShellProcess, StderrMode};
use super::unix::PYTHONIOENCODING;
use super::{ExitWaiter, Pseudoterminal, PtyTiming, ShellFuture, ShellPseudoterminalArguments};
use crate::display::TerminalDisplay;
use crate::error::{PseudoterminalError, Result};
use crate::spawn::{ProcessSpawner, SpawnCommand};
use crate::sync::{Latch, OutcomeLatch};

/// Resizer script run by the interpreter.
pub const WIN32_RESIZER_PY: &str = include_str!("../../assets/win32_resizer.py");

/// The Windows console host.
pub const WINDOWS_CONHOST_PATH: &str = r"C:\Windows\System32\conhost.exe";

const TEMP_PREFIX: &str = "paneterm-";

/// Quote an argument for `cmd.exe`, doubling embedded quotes.
pub fn escape_argument(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\"\""))
}

/// Escaped command line for an executable and its arguments.
pub fn command_line(executable: &str, args: &[String]) -> String {
    std::iter::once(executable)
        .chain(args.iter().map(String::as_str))
        .map(escape_argument)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Batch script running `command_line` and writing its exit code to
/// `code_path`.
///
/// The final line is a single command so that answering "Terminate batch
/// job (Y/N)?" cannot skip recording the code.
pub fn batch_script(command_line: &str, code_path: &Path) -> String {
    format!(
        "@echo off\r\nsetlocal EnableDelayedExpansion\r\n{} & echo !ERRORLEVEL! > {}\r\n",
        command_line,
        escape_argument(&code_path.to_string_lossy())
    )
}

/// Exit descriptor from the capture file, falling back to the wrapper's.
pub async fn recover_exit_status(code_path: &Path, wrapper: ExitStatus) -> ExitStatus {
    match tokio::fs::read_to_string(code_path).await {
        Ok(text) => match ExitStatus::parse_code(&text) {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(path = %code_path.display(), error = %e, "Unparseable exit code");
                wrapper
            }
        },
        Err(e) => {
            tracing::debug!(path = %code_path.display(), error = %e, "Exit code unavailable");
            wrapper
        }
    }
}

/// Remove temporary files after the grace delay, retrying with backoff.
pub async fn cleanup_files(paths: Vec<PathBuf>, timing: PtyTiming) {
    tokio::time::sleep(timing.exit_cleanup_wait).await;
    for path in paths {
        let mut delay = timing.exit_cleanup_wait / 4;
        for attempt in 0..=timing.exit_cleanup_retries {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt == timing.exit_cleanup_retries => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), attempt, error = %e, "Retrying temporary file removal");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

fn temp_path(suffix: &str) -> Result<PathBuf> {
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(suffix)
        .tempfile()?
        .into_temp_path()
        .keep()
        .map_err(|e| PseudoterminalError::Io(e.to_string()))
}

/// The generated script and its capture file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFiles {
    pub script: PathBuf,
    pub code: PathBuf,
}

impl ScriptFiles {
    async fn create(args: &ShellPseudoterminalArguments) -> Result<Self> {
        let script = temp_path(".bat")?;
        let code = match temp_path(".exitcode") {
            Ok(code) => code,
            Err(e) => {
                let _ = tokio::fs::remove_file(&script).await;
                return Err(e);
            }
        };
        let files = Self { script, code };
        let contents = batch_script(&command_line(&args.executable, &args.args), &files.code);
        if let Err(e) = tokio::fs::write(&files.script, contents).await {
            files.remove().await;
            return Err(e.into());
        }
        Ok(files)
    }

    async fn remove(&self) {
        let _ = tokio::fs::remove_file(&self.script).await;
        let _ = tokio::fs::remove_file(&self.code).await;
    }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.script.clone(), self.code.clone()]
    }
}

fn comspec() -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}

struct Session {
    shell: OutcomeLatch<Arc<ShellProcess>>,
    exit: OutcomeLatch<ExitStatus>,
    /// Settles with the resizer once the handshake is done, or `None`.
    resizer: Latch<Option<Arc<ShellProcess>>>,
}

/// A shell on a Windows host.
pub struct WindowsPseudoterminal {
    session: Arc<Session>,
    conhost: bool,
}

impl WindowsPseudoterminal {
    /// Start the shell. Must be called inside a Tokio runtime.
    pub fn new(
        args: ShellPseudoterminalArguments,
        spawner: Arc<dyn ProcessSpawner>,
        timing: PtyTiming,
    ) -> Self {
        let conhost = args.use_win32_conhost;
        let session = Arc::new(Session {
            shell: Latch::new(),
            exit: Latch::new(),
            resizer: Latch::new(),
        });
        tokio::spawn(run(Arc::clone(&session), args, spawner, timing));
        Self { session, conhost }
    }

    /// The wrapper process that runs `script`.
    pub fn command(args: &ShellPseudoterminalArguments, script: &Path, resizer: bool) -> SpawnCommand {
        let script = script.to_string_lossy().into_owned();
        let command = if args.use_win32_conhost {
            SpawnCommand::new(WINDOWS_CONHOST_PATH).arg(script)
        } else {
            SpawnCommand::new(comspec()).args(["/D", "/S", "/C"]).arg(script)
        };
        command.cwd(args.cwd.clone()).hide_window(!resizer)
    }

    /// The resizer process for an interpreter.
    pub fn resizer_command(python: &str) -> SpawnCommand {
        SpawnCommand::new(python)
            .arg("-c")
            .arg(WIN32_RESIZER_PY)
            .env("PYTHONIOENCODING", PYTHONIOENCODING)
            .hide_window(true)
    }
}

fn spawn_resizer(spawner: &dyn ProcessSpawner, python: &str) -> Option<Arc<ShellProcess>> {
    let spawned = match spawner.spawn(WindowsPseudoterminal::resizer_command(python)) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::warn!(python = %python, error = %e, "Failed to spawn resizer");
            return None;
        }
    };
    let resizer = ShellProcess::start(spawned, StderrMode::MergeAndLog);

    let exited = resizer.exited();
    tokio::spawn(async move {
        if let Some(status) = exited.wait().await {
            if !status.is_success() {
                tracing::warn!(status = %status, "Resizer exited unexpectedly");
            }
        }
    });
    Some(resizer)
}

/// Hand the shell's pid to the resizer and keep it alive until it exits.
async fn handshake(resizer: &Arc<ShellProcess>, pid: Option<u32>, interval: Duration) -> Result<()> {
    resizer.write(&encode_pid_frame(pid)).await?;

    let watchdog = Arc::clone(resizer);
    tokio::spawn(async move {
        let mut exited = Box::pin(watchdog.exited().wait());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = watchdog.write(KEEP_ALIVE_FRAME).await {
                        tracing::debug!(error = %e, "Resizer keep-alive failed");
                    }
                }
                _ = &mut exited => break,
            }
        }
    });
    Ok(())
}

async fn run(
    session: Arc<Session>,
    args: ShellPseudoterminalArguments,
    spawner: Arc<dyn ProcessSpawner>,
    timing: PtyTiming,
) {
    let resizer = args
        .python_executable
        .as_deref()
        .and_then(|python| spawn_resizer(spawner.as_ref(), python));

    let fail = |e: PseudoterminalError| {
        tracing::warn!(executable = %args.executable, error = %e, "Failed to start shell");
        session.resizer.set(None);
        session.shell.set(Err(e.clone()));
        session.exit.set(Err(e));
    };

    let files = match ScriptFiles::create(&args).await {
        Ok(files) => files,
        Err(e) => {
            if let Some(ref resizer) = resizer {
                let _ = resizer.kill().await;
            }
            fail(e);
            return;
        }
    };

    let command = WindowsPseudoterminal::command(&args, &files.script, resizer.is_some());
    let spawned = match spawner.spawn(command) {
        Ok(spawned) => spawned,
        Err(e) => {
            if let Some(ref resizer) = resizer {
                let _ = resizer.kill().await;
            }
            files.remove().await;
            fail(e);
            return;
        }
    };

    let process = ShellProcess::start(spawned, StderrMode::Merge);
    session.shell.set(Ok(Arc::clone(&process)));
    tracing::info!(executable = %args.executable, pid = ?process.pid(), "Shell started");

    let resizer = match resizer {
        Some(resizer) => match handshake(&resizer, process.pid(), timing.resizer_watchdog_interval).await {
            Ok(()) => Some(resizer),
            Err(e) => {
                tracing::warn!(error = %e, "Resizer handshake failed");
                let _ = resizer.kill().await;
                None
            }
        },
        None => None,
    };
    session.resizer.set(resizer.clone());

    let wrapper = process.exited().wait().await.unwrap_or(ExitStatus::Unknown);
    let status = recover_exit_status(&files.code, wrapper).await;
    tracing::info!(pid = ?process.pid(), status = %status, "Shell exited");
    session.exit.set(Ok(status));

    if let Some(resizer) = resizer {
        if resizer.exit_status().is_none() {
            let _ = resizer.kill().await;
        }
    }
    tokio::spawn(cleanup_files(files.paths(), timing));
}

#[async_trait]
impl Pseudoterminal for WindowsPseudoterminal {
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
        // The console host paints its initial screen as the first chunk.
        pipe_process(process, display, self.session.exit.outcome(), self.conhost).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let resizer = self
            .session
            .resizer
            .waiter()
            .wait()
            .await
            .flatten()
            .ok_or(PseudoterminalError::ResizerDisabled)?;
        if resizer.exit_status().is_some() {
            return Err(PseudoterminalError::ResizerDisabled);
        }
        resizer
            .write(&TerminalSize::new(cols, rows).to_frame())
            .await
            .map_err(|e| PseudoterminalError::ResizeFailed(e.to_string()))
    }
}
