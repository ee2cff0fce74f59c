//! Exit descriptors for terminated sessions.
//!
//! Every session, whether it wraps an OS process or not, settles with an
//! [`ExitStatus`]: a numeric code, a POSIX signal name, or `Unknown` when
//! the platform reported neither.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ExitStatus {
    /// Process exited with a numeric code.
    Code(i32),
    /// Process was terminated by a signal (`SIGTERM`, `SIGKILL`, ...).
    Signal(String),
    /// Neither a code nor a signal was reported.
    Unknown,
}

/// The descriptor used for sessions that end normally.
pub const EXIT_SUCCESS: ExitStatus = ExitStatus::Code(0);

/// Signals that count as an orderly shutdown.
pub const CLEAN_EXIT_SIGNALS: &[&str] = &["SIGINT", "SIGTERM"];

impl ExitStatus {
    /// Returns the exit code, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }

    /// Returns the signal name, if any.
    pub fn signal(&self) -> Option<&str> {
        match self {
            ExitStatus::Signal(name) => Some(name),
            _ => None,
        }
    }

    /// Returns true for code 0.
    pub fn is_success(&self) -> bool {
        *self == EXIT_SUCCESS
    }

    /// Returns true for code 0 and for interrupt/termination signals.
    pub fn is_clean(&self) -> bool {
        match self {
            ExitStatus::Code(code) => *code == 0,
            ExitStatus::Signal(name) => CLEAN_EXIT_SIGNALS.contains(&name.as_str()),
            ExitStatus::Unknown => false,
        }
    }

    /// Parses the text written by a shell's exit-code capture
    /// (`echo %ERRORLEVEL% > file`), tolerating surrounding whitespace.
    pub fn parse_code(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        trimmed
            .parse::<i32>()
            .map(ExitStatus::Code)
            .map_err(|_| ProtocolError::InvalidExitCode(trimmed.to_string()))
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        EXIT_SUCCESS
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "{}", code),
            ExitStatus::Signal(name) => f.write_str(name),
            ExitStatus::Unknown => f.write_str("unknown"),
        }
    }
}

impl FromStr for ExitStatus {
    type Err = ProtocolError;

    /// Inverse of `Display`: numbers become codes, `SIG*` names become
    /// signals, `unknown` becomes `Unknown`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unknown") {
            return Ok(ExitStatus::Unknown);
        }
        if s.starts_with("SIG") && s.len() > 3 {
            return Ok(ExitStatus::Signal(s.to_string()));
        }
        ExitStatus::parse_code(s)
    }
}
