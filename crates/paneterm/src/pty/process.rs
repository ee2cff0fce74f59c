//! A running shell process.
//!
//! A [`ShellProcess`] owns the child handle through a small actor task so
//! that waiting for exit and delivering kill requests never contend on a
//! lock. stdout and stderr are pumped into a single output stream that is
//! held back until the first subscriber, so nothing the shell prints
//! before a display attaches is lost.

use std::future::IntoFuture;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use protocol::ExitStatus;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::display::{clear_display, DisplayEvent, TerminalDisplay};
use crate::error::{PseudoterminalError, Result};
use crate::spawn::{BoxedReader, BoxedWriter, ChildHandle, SpawnedProcess};
use crate::sync::{Latch, LatchWaiter, Outcome};

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 256;

/// Output kept for the first subscriber before older chunks are dropped.
const MAX_BACKLOG_BYTES: usize = 1024 * 1024;

type KillRequest = oneshot::Sender<io::Result<()>>;

/// What to do with the process's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Interleave with stdout.
    Merge,
    /// Interleave with stdout and also log each chunk.
    MergeAndLog,
}

/// Output stream handed to a subscriber.
pub struct OutputSubscription {
    /// Chunks produced before anyone subscribed. Only the first
    /// subscriber receives them.
    pub backlog: Vec<Bytes>,
    pub rx: broadcast::Receiver<Bytes>,
}

struct TapState {
    tx: Option<broadcast::Sender<Bytes>>,
    backlog: Vec<Bytes>,
    backlog_bytes: usize,
    subscribed: bool,
    open_pumps: usize,
}

struct OutputTap {
    state: Mutex<TapState>,
}

impl OutputTap {
    fn new(pumps: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(TapState {
                tx: Some(tx),
                backlog: Vec::new(),
                backlog_bytes: 0,
                subscribed: false,
                open_pumps: pumps,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, chunk: Bytes) {
        let mut state = self.lock();
        if state.subscribed {
            if let Some(ref tx) = state.tx {
                // No receivers is fine; every display may have detached.
                let _ = tx.send(chunk);
            }
            return;
        }

        state.backlog_bytes += chunk.len();
        state.backlog.push(chunk);
        while state.backlog_bytes > MAX_BACKLOG_BYTES && state.backlog.len() > 1 {
            let dropped = state.backlog.remove(0);
            state.backlog_bytes -= dropped.len();
        }
    }

    fn close_pump(&self) {
        let mut state = self.lock();
        state.open_pumps = state.open_pumps.saturating_sub(1);
        if state.open_pumps == 0 {
            state.tx = None;
        }
    }

    fn is_claimed(&self) -> bool {
        self.lock().subscribed
    }

    fn subscribe(&self) -> OutputSubscription {
        let mut state = self.lock();
        let backlog = if state.subscribed {
            Vec::new()
        } else {
            state.subscribed = true;
            state.backlog_bytes = 0;
            std::mem::take(&mut state.backlog)
        };
        let rx = match state.tx {
            Some(ref tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        OutputSubscription { backlog, rx }
    }
}

/// A started shell process.
pub struct ShellProcess {
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<BoxedWriter>,
    output: Arc<OutputTap>,
    kill_tx: mpsc::Sender<KillRequest>,
    exit: Arc<Latch<ExitStatus>>,
}

impl ShellProcess {
    /// Take ownership of a spawned process and start its pumps.
    ///
    /// The control channel, if any, is left in `spawned` for the caller
    /// to take beforehand. Must be called inside a Tokio runtime.
    pub fn start(spawned: SpawnedProcess, stderr: StderrMode) -> Arc<Self> {
        let SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr: stderr_stream,
            handle,
            ..
        } = spawned;

        let output = Arc::new(OutputTap::new(2));
        tokio::spawn(pump(stdout, Arc::clone(&output), pid, false));
        tokio::spawn(pump(
            stderr_stream,
            Arc::clone(&output),
            pid,
            stderr == StderrMode::MergeAndLog,
        ));

        let exit = Arc::new(Latch::new());
        let (kill_tx, kill_rx) = mpsc::channel(8);
        tokio::spawn(supervise(handle, kill_rx, Arc::clone(&exit), pid));

        Arc::new(Self {
            pid,
            stdin: tokio::sync::Mutex::new(stdin),
            output,
            kill_tx,
            exit,
        })
    }

    /// Process ID, if the OS reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write input to the process's stdin.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(data)
            .await
            .map_err(|e| PseudoterminalError::WriteFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| PseudoterminalError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Subscribe to merged stdout and stderr.
    pub fn subscribe(&self) -> OutputSubscription {
        self.output.subscribe()
    }

    /// Whether the output held back for the first subscriber has been
    /// handed out.
    pub fn output_claimed(&self) -> bool {
        self.output.is_claimed()
    }

    /// Ask the process to terminate.
    ///
    /// Fails with [`PseudoterminalError::KillFailed`] if the process has
    /// already exited or the OS refuses.
    pub async fn kill(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.kill_tx.send(reply_tx).await.is_err() {
            return Err(PseudoterminalError::KillFailed(
                "process already exited".to_string(),
            ));
        }
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PseudoterminalError::KillFailed(e.to_string())),
            Err(_) => Err(PseudoterminalError::KillFailed(
                "process already exited".to_string(),
            )),
        }
    }

    /// Resolves with the exit status.
    pub fn exited(&self) -> LatchWaiter<ExitStatus> {
        self.exit.waiter()
    }

    /// Exit status, if the process has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.get()
    }
}

async fn supervise(
    mut handle: Box<dyn ChildHandle>,
    mut kill_rx: mpsc::Receiver<KillRequest>,
    exit: Arc<Latch<ExitStatus>>,
    pid: Option<u32>,
) {
    let status = loop {
        tokio::select! {
            status = handle.wait() => {
                break match status {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
                        ExitStatus::Unknown
                    }
                };
            }
            Some(reply) = kill_rx.recv() => {
                let result = handle.kill();
                if let Err(ref e) = result {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to kill process");
                }
                let _ = reply.send(result);
            }
        }
    };

    tracing::info!(pid = ?pid, status = %status, "Process exited");
    exit.set(status);
}

async fn pump(mut reader: BoxedReader, tap: Arc<OutputTap>, pid: Option<u32>, log: bool) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if log {
                    tracing::warn!(
                        pid = ?pid,
                        "process stderr: {}",
                        String::from_utf8_lossy(&chunk).trim_end()
                    );
                }
                tap.publish(chunk);
            }
            Err(e) => {
                tracing::debug!(pid = ?pid, error = %e, "Output pump stopped");
                break;
            }
        }
    }
    tap.close_pump();
}

/// Connect a process to a display.
///
/// Clears the display (keeping its contents in scrollback), forwards
/// process output to it and typed data back to the process. Forwarding
/// stops when the display is disposed or the session exits. With
/// `skip_first_chunk` the first output chunk is discarded.
pub(crate) async fn pipe_process(
    process: Arc<ShellProcess>,
    display: Arc<dyn TerminalDisplay>,
    exit: Outcome<ExitStatus>,
    skip_first_chunk: bool,
) -> Result<()> {
    clear_display(display.as_ref(), true).await?;

    let mut output = process.subscribe();
    let mut events = display.subscribe();
    let display_id = display.id();

    let sink = Arc::clone(&display);
    tokio::spawn(async move {
        let mut skip = skip_first_chunk;
        for chunk in std::mem::take(&mut output.backlog) {
            if std::mem::take(&mut skip) {
                continue;
            }
            if sink.write(&chunk).await.is_err() {
                return;
            }
        }
        loop {
            match output.rx.recv().await {
                Ok(chunk) => {
                    if std::mem::take(&mut skip) {
                        continue;
                    }
                    if let Err(e) = sink.write(&chunk).await {
                        tracing::debug!(display = %sink.id(), error = %e, "Display write failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(display = %sink.id(), skipped = n, "Display lagged behind process output");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(async move {
        let mut exited = exit.into_future();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(DisplayEvent::Data(data)) => {
                        if let Err(e) = process.write(data.as_bytes()).await {
                            tracing::debug!(display = %display_id, error = %e, "Dropped display input");
                        }
                    }
                    Ok(DisplayEvent::Disposed) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(display = %display_id, skipped = n, "Input events lagged");
                    }
                },
                _ = &mut exited => break,
            }
        }
    });

    Ok(())
}
