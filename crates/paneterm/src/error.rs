//! Error types shared by the pseudoterminal backends.
//!
//! Errors are `Clone` because a single failure (a spawn error, say) settles
//! every waiter on a session's shell and exit futures.

use thiserror::Error;

/// Errors raised by pseudoterminal sessions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PseudoterminalError {
    /// The process could not be started.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Resizing needs a helper process that is absent or has died.
    #[error("resizer disabled")]
    ResizerDisabled,

    /// The session kind has no notion of size.
    #[error("resize not supported")]
    ResizeUnsupported,

    /// The resize request could not be delivered to the helper.
    #[error("failed to resize pseudoterminal: {0}")]
    ResizeFailed(String),

    /// The operating system refused the kill request.
    #[error("failed to kill pseudoterminal: {0}")]
    KillFailed(String),

    /// The session already settled; no further displays can attach.
    #[error("pseudoterminal already exited")]
    Exited,

    /// The session was dropped before it settled.
    #[error("pseudoterminal abandoned before exit")]
    Abandoned,

    /// Writing to the process failed.
    #[error("failed to write to process: {0}")]
    WriteFailed(String),

    /// A display rejected a write.
    #[error("display error: {0}")]
    Display(String),

    /// Too many tasks are queued on the session lock.
    #[error("lock busy: {0} pending operations")]
    LockBusy(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PseudoterminalError {
    fn from(err: std::io::Error) -> Self {
        PseudoterminalError::Io(err.to_string())
    }
}

impl From<DisplayError> for PseudoterminalError {
    fn from(err: DisplayError) -> Self {
        PseudoterminalError::Display(err.to_string())
    }
}

/// Errors raised by terminal displays.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DisplayError {
    /// The display was disposed.
    #[error("display disposed")]
    Disposed,

    /// The underlying output failed.
    #[error("display write failed: {0}")]
    WriteFailed(String),
}

impl From<std::io::Error> for DisplayError {
    fn from(err: std::io::Error) -> Self {
        DisplayError::WriteFailed(err.to_string())
    }
}

/// Result type alias for pseudoterminal operations.
pub type Result<T> = std::result::Result<T, PseudoterminalError>;
