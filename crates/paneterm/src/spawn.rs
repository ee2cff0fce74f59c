//! Process spawning.
//!
//! Backends describe the process they need as a [`SpawnCommand`] and hand
//! it to a [`ProcessSpawner`]. The production spawner is [`TokioSpawner`];
//! tests substitute scripted processes.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use protocol::ExitStatus;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{PseudoterminalError, Result};

/// Boxed async byte sink.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed async byte source.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Descriptor number the control channel occupies in the child.
pub const CONTROL_FD: i32 = 3;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Everything needed to start a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Suppress the console window (Windows only).
    pub hide_window: bool,
    /// Open a write-only channel to the child's descriptor [`CONTROL_FD`]
    /// (Unix only).
    pub control_channel: bool,
}

impl SpawnCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn hide_window(mut self, hide: bool) -> Self {
        self.hide_window = hide;
        self
    }

    pub fn control_channel(mut self, enabled: bool) -> Self {
        self.control_channel = enabled;
        self
    }

    /// Value of an added environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Control over a running child.
#[async_trait]
pub trait ChildHandle: Send {
    /// Ask the process to terminate. Fails if the OS refuses or the
    /// process is already gone.
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// A started process and its streams.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub control: Option<BoxedWriter>,
    pub handle: Box<dyn ChildHandle>,
}

/// Starts processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: SpawnCommand) -> Result<SpawnedProcess>;
}

/// Convert an OS exit status into a descriptor.
pub fn exit_status_from_std(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        return ExitStatus::Code(code);
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return match Signal::try_from(signal) {
                Ok(signal) => ExitStatus::Signal(signal.as_str().to_string()),
                Err(_) => ExitStatus::Signal(format!("SIG{}", signal)),
            };
        }
    }
    ExitStatus::Unknown
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, command: SpawnCommand) -> Result<SpawnedProcess> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = command.cwd {
            cmd.current_dir(dir);
        }

        #[cfg(windows)]
        if command.hide_window {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        #[cfg(unix)]
        let channel = if command.control_channel {
            let pipe = control_pipe::ControlPipe::new()?;
            pipe.install(&mut cmd);
            Some(pipe)
        } else {
            None
        };
        #[cfg(not(unix))]
        if command.control_channel {
            tracing::warn!(program = %command.program, "control channel is not available on this platform");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PseudoterminalError::SpawnFailed(format!("{}: {}", command.program, e)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PseudoterminalError::SpawnFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PseudoterminalError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PseudoterminalError::SpawnFailed("stderr not captured".to_string()))?;

        #[cfg(unix)]
        let control = match channel {
            Some(pipe) => Some(pipe.into_writer()?),
            None => None,
        };
        #[cfg(not(unix))]
        let control: Option<BoxedWriter> = None;

        tracing::debug!(pid = ?pid, program = %command.program, "spawned process");

        Ok(SpawnedProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control,
            handle: Box::new(TokioChild { child }),
        })
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildHandle for TokioChild {
    #[cfg(unix)]
    fn kill(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self
            .child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await.map(exit_status_from_std)
    }
}

#[cfg(unix)]
mod control_pipe {
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::unistd::{dup2, pipe};
    use tokio::net::unix::pipe::Sender;

    use super::{BoxedWriter, CONTROL_FD};

    /// A pipe whose read end becomes the child's [`CONTROL_FD`].
    pub(super) struct ControlPipe {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl ControlPipe {
        pub(super) fn new() -> io::Result<Self> {
            let (read, write) = pipe()?;
            // Keep both ends out of unrelated children spawned concurrently.
            for fd in [&read, &write] {
                fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
            }
            Ok(Self { read, write })
        }

        pub(super) fn install(&self, cmd: &mut tokio::process::Command) {
            let read_fd = self.read.as_raw_fd();
            // SAFETY: the closure only calls async-signal-safe functions
            // (dup2, fcntl) between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    if read_fd == CONTROL_FD {
                        fcntl(read_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                    } else {
                        // dup2 clears close-on-exec on the new descriptor.
                        dup2(read_fd, CONTROL_FD)?;
                    }
                    Ok(())
                });
            }
        }

        /// Close the parent's read end and wrap the write end.
        pub(super) fn into_writer(self) -> io::Result<BoxedWriter> {
            drop(self.read);
            let sender = Sender::from_owned_fd(self.write)?;
            Ok(Box::new(sender))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted processes for backend tests.

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, oneshot, Notify};

    use super::*;

    const PIPE_CAPACITY: usize = 64 * 1024;

    /// The test's end of a scripted process.
    pub(crate) struct FakeProcess {
        pub command: SpawnCommand,
        /// Reads what the session writes to the process.
        pub stdin: DuplexStream,
        /// Output written here reaches the session as stdout.
        pub stdout: DuplexStream,
        pub stderr: DuplexStream,
        /// Reads the control channel, if one was requested.
        pub control: Option<DuplexStream>,
        exit: Option<oneshot::Sender<ExitStatus>>,
        pub kills: Arc<AtomicUsize>,
    }

    impl FakeProcess {
        /// Make the process exit.
        pub fn exit(&mut self, status: ExitStatus) {
            if let Some(tx) = self.exit.take() {
                let _ = tx.send(status);
            }
        }
    }

    struct FakeChild {
        exit: Option<oneshot::Receiver<ExitStatus>>,
        killed: Arc<Notify>,
        kills: Arc<AtomicUsize>,
        exited: bool,
    }

    #[async_trait]
    impl ChildHandle for FakeChild {
        fn kill(&mut self) -> io::Result<()> {
            if self.exited {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
            }
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.killed.notify_one();
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<ExitStatus> {
            let status = match self.exit.as_mut() {
                Some(exit) => {
                    tokio::select! {
                        status = exit => status.unwrap_or(ExitStatus::Unknown),
                        _ = self.killed.notified() => ExitStatus::Signal("SIGTERM".to_string()),
                    }
                }
                None => ExitStatus::Unknown,
            };
            self.exit = None;
            self.exited = true;
            Ok(status)
        }
    }

    /// Spawner handing every started process to the test.
    pub(crate) struct FakeSpawner {
        processes: mpsc::UnboundedSender<FakeProcess>,
        failing: Mutex<HashSet<String>>,
        commands: Mutex<Vec<SpawnCommand>>,
        next_pid: AtomicUsize,
    }

    impl FakeSpawner {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeProcess>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let spawner = Arc::new(Self {
                processes: tx,
                failing: Mutex::new(HashSet::new()),
                commands: Mutex::new(Vec::new()),
                next_pid: AtomicUsize::new(1000),
            });
            (spawner, rx)
        }

        /// Make spawning `program` fail.
        pub fn fail(&self, program: &str) {
            self.failing.lock().unwrap().insert(program.to_string());
        }

        pub fn commands(&self) -> Vec<SpawnCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, command: SpawnCommand) -> Result<SpawnedProcess> {
            self.commands.lock().unwrap().push(command.clone());
            if self.failing.lock().unwrap().contains(&command.program) {
                return Err(PseudoterminalError::SpawnFailed(format!(
                    "{}: not found",
                    command.program
                )));
            }

            let (stdin_ours, stdin_theirs) = tokio::io::duplex(PIPE_CAPACITY);
            let (stdout_ours, stdout_theirs) = tokio::io::duplex(PIPE_CAPACITY);
            let (stderr_ours, stderr_theirs) = tokio::io::duplex(PIPE_CAPACITY);
            let (control_ours, control_theirs) = if command.control_channel {
                let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
                (Some(Box::new(ours) as BoxedWriter), Some(theirs))
            } else {
                (None, None)
            };
            let (exit_tx, exit_rx) = oneshot::channel();
            let kills = Arc::new(AtomicUsize::new(0));
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;

            let process = FakeProcess {
                command,
                stdin: stdin_theirs,
                stdout: stdout_theirs,
                stderr: stderr_theirs,
                control: control_theirs,
                exit: Some(exit_tx),
                kills: Arc::clone(&kills),
            };
            let _ = self.processes.send(process);

            Ok(SpawnedProcess {
                pid: Some(pid),
                stdin: Box::new(stdin_ours),
                stdout: Box::new(stdout_ours),
                stderr: Box::new(stderr_ours),
                control: control_ours,
                handle: Box::new(FakeChild {
                    exit: Some(exit_rx),
                    killed: Arc::new(Notify::new()),
                    kills,
                    exited: false,
                }),
            })
        }
    }
}
