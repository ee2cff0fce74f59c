//! # Paneterm Protocol Library
//!
//! Value types and wire formats shared by every Paneterm backend.
//!
//! ## Overview
//!
//! - **Exit Descriptors**: how a session ended (code, signal or unknown)
//! - **Resize Framing**: the `<cols>x<rows>\n` side channel spoken by the
//!   resize helpers
//! - **Log Events**: tagged events rendered by the developer console
//! - **Control Sequences**: the CSI/SGR subset written to displays
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ExitStatus, ResizeDecoder, ResizeMessage, TerminalSize};
//!
//! let frame = TerminalSize::new(80, 24).to_frame();
//! assert_eq!(frame, b"80x24\n");
//!
//! let mut decoder = ResizeDecoder::new();
//! let messages = decoder.push(&frame).unwrap();
//! assert_eq!(messages, vec![ResizeMessage::Resize(TerminalSize::new(80, 24))]);
//!
//! assert!(ExitStatus::parse_code("0\r\n").unwrap().is_success());
//! ```
//!
//! ## Modules
//!
//! - [`exit`]: Exit descriptors
//! - [`framing`]: Resize side-channel frames
//! - [`log`]: Log events
//! - [`control`]: Control-sequence helpers
//! - [`error`]: Error types

pub mod control;
pub mod error;
pub mod exit;
pub mod framing;
pub mod log;

pub use error::{ProtocolError, Result};
pub use exit::{ExitStatus, CLEAN_EXIT_SIGNALS, EXIT_SUCCESS};
pub use framing::{
    encode_pid_frame, ResizeDecoder, ResizeMessage, TerminalSize, FRAME_TERMINATOR,
    KEEP_ALIVE_FRAME, MAX_FRAME_LENGTH,
};
pub use log::{
    LogEntry, LogLevel, LogRecord, UnhandledRejection, WindowError, UNHANDLED_REJECTION_MESSAGE,
};
