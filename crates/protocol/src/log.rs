//! Log events consumed by the developer console.
//!
//! Events are tagged `{ "type": ..., "data": ... }`. Console-style events
//! carry the raw argument list; window errors and unhandled rejections carry
//! structured details.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix used when rendering an unhandled promise rejection.
pub const UNHANDLED_REJECTION_MESSAGE: &str = "Uncaught (in promise)";

/// Severity used to pick a colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Details of an uncaught error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WindowError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Stack trace, if one was captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Details of a promise rejection nobody handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnhandledRejection {
    pub reason: Value,
}

/// A single log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum LogRecord {
    Debug(Vec<Value>),
    Error(Vec<Value>),
    Info(Vec<Value>),
    Warn(Vec<Value>),
    WindowError(WindowError),
    UnhandledRejection(UnhandledRejection),
}

impl LogRecord {
    /// Shorthand for a single-string info event.
    pub fn info(message: impl Into<String>) -> Self {
        LogRecord::Info(vec![Value::String(message.into())])
    }

    /// Shorthand for a single-string error event.
    pub fn error(message: impl Into<String>) -> Self {
        LogRecord::Error(vec![Value::String(message.into())])
    }

    /// Shorthand for a single-string warning event.
    pub fn warn(message: impl Into<String>) -> Self {
        LogRecord::Warn(vec![Value::String(message.into())])
    }

    /// Shorthand for a single-string debug event.
    pub fn debug(message: impl Into<String>) -> Self {
        LogRecord::Debug(vec![Value::String(message.into())])
    }

    /// The severity this event is displayed with.
    pub fn level(&self) -> LogLevel {
        match self {
            LogRecord::Debug(_) => LogLevel::Debug,
            LogRecord::Info(_) => LogLevel::Info,
            LogRecord::Warn(_) => LogLevel::Warn,
            LogRecord::Error(_) | LogRecord::WindowError(_) | LogRecord::UnhandledRejection(_) => {
                LogLevel::Error
            }
        }
    }

    /// The argument list of a console-style event.
    pub fn args(&self) -> Option<&[Value]> {
        match self {
            LogRecord::Debug(args)
            | LogRecord::Error(args)
            | LogRecord::Info(args)
            | LogRecord::Warn(args) => Some(args),
            _ => None,
        }
    }
}

/// A log event together with its position in the stream.
///
/// Ids are unique and increase monotonically within one stream, so they
/// can key caches of derived data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    #[serde(flatten)]
    pub record: LogRecord,
}
