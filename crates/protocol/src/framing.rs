//! Line framing for the resize side channel.
//!
//! # Frame Format
//!
//! The resize helpers read newline-terminated ASCII lines:
//! - `<cols>x<rows>\n`: apply a new window size
//! - `<pid>\n`: (resizer handshake only) the console process to attach to
//! - `\n`: watchdog keep-alive, carries no payload
//!
//! A helper that stops receiving keep-alives assumes its parent is gone.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Frame terminator.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Separator between columns and rows.
pub const SIZE_SEPARATOR: char = 'x';

/// Longest line accepted by [`ResizeDecoder`] before a terminator.
pub const MAX_FRAME_LENGTH: usize = 64;

/// The keep-alive frame written by the resizer watchdog.
pub const KEEP_ALIVE_FRAME: &[u8] = b"\n";

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns.
    pub cols: u16,
    /// Number of rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new size.
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Encode as a resize frame, `"<cols>x<rows>\n"`.
    pub fn to_frame(self) -> Vec<u8> {
        format!("{}{}{}\n", self.cols, SIZE_SEPARATOR, self.rows).into_bytes()
    }

    /// Parse the payload of a resize frame (without terminator).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\r');
        let (cols, rows) = line
            .split_once(SIZE_SEPARATOR)
            .ok_or_else(|| ProtocolError::InvalidResizeFrame(line.to_string()))?;
        let cols = cols
            .trim()
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidResizeFrame(line.to_string()))?;
        let rows = rows
            .trim()
            .parse::<u16>()
            .map_err(|_| ProtocolError::InvalidResizeFrame(line.to_string()))?;
        Ok(Self { cols, rows })
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.cols, SIZE_SEPARATOR, self.rows)
    }
}

/// Encode the resizer handshake frame carrying the console process id.
/// A missing pid is sent as `-1`, which the helper treats as "no console".
pub fn encode_pid_frame(pid: Option<u32>) -> Vec<u8> {
    match pid {
        Some(pid) => format!("{}\n", pid).into_bytes(),
        None => b"-1\n".to_vec(),
    }
}

/// A decoded side-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMessage {
    /// Apply a new size.
    Resize(TerminalSize),
    /// Watchdog keep-alive.
    KeepAlive,
}

/// Incremental decoder for the resize side channel.
///
/// Bytes can arrive split at arbitrary points; complete lines are decoded
/// as soon as their terminator arrives.
#[derive(Debug, Default)]
pub struct ResizeDecoder {
    buffer: Vec<u8>,
}

impl ResizeDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes still waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes and return every complete message.
    ///
    /// A malformed line is reported as an error; it is consumed, so the
    /// decoder stays usable for the lines that follow.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ResizeMessage>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == FRAME_TERMINATOR) {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            let line = line.trim();
            if line.is_empty() {
                messages.push(ResizeMessage::KeepAlive);
            } else {
                messages.push(ResizeMessage::Resize(TerminalSize::parse(line)?));
            }
        }
        if self.buffer.len() > MAX_FRAME_LENGTH {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_LENGTH,
            });
        }
        Ok(messages)
    }
}
