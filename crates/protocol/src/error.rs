//! Error types for the protocol crate.

use thiserror::Error;

/// Malformed frames and values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A resize frame did not match `<cols>x<rows>`.
    #[error("invalid resize frame: {0:?}")]
    InvalidResizeFrame(String),

    /// A resize frame exceeded the maximum line length without a terminator.
    #[error("resize frame too long: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Maximum allowed frame length.
        max: usize,
    },

    /// An exit code capture could not be parsed.
    #[error("invalid exit code: {0:?}")]
    InvalidExitCode(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
