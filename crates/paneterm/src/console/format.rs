//! Rendering log events as coloured text.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::control::{styled, Color};
use protocol::{LogEntry, LogRecord, WindowError, UNHANDLED_REJECTION_MESSAGE};
use serde_json::Value;

/// Nesting shown before objects collapse to `[Object]`.
pub const DEFAULT_INSPECT_DEPTH: u32 = 2;

/// Formatted events kept before the cache is pruned.
const CACHE_LIMIT: usize = 4096;

/// Formats log events, remembering the result per event id.
#[derive(Debug)]
pub struct LogFormatter {
    cache: DashMap<u64, Arc<str>>,
    depth: AtomicU32,
}

impl Default for LogFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_INSPECT_DEPTH)
    }
}

impl LogFormatter {
    pub fn new(depth: u32) -> Self {
        Self {
            cache: DashMap::new(),
            depth: AtomicU32::new(depth),
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Change the inspection depth. Cached text is dropped when it changes.
    pub fn set_depth(&self, depth: u32) {
        if self.depth.swap(depth, Ordering::SeqCst) != depth {
            self.cache.clear();
        }
    }

    /// Coloured text for an event.
    pub fn format(&self, entry: &LogEntry) -> Arc<str> {
        if let Some(text) = self.cache.get(&entry.id) {
            return Arc::clone(text.value());
        }
        let text: Arc<str> = format_record(&entry.record, self.depth()).into();
        if self.cache.len() >= CACHE_LIMIT {
            let cutoff = entry.id.saturating_sub(CACHE_LIMIT as u64 / 2);
            self.cache.retain(|id, _| *id >= cutoff);
        }
        self.cache.insert(entry.id, Arc::clone(&text));
        text
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// Coloured text for a record.
pub fn format_record(record: &LogRecord, depth: u32) -> String {
    let text = match record {
        LogRecord::Debug(args)
        | LogRecord::Info(args)
        | LogRecord::Warn(args)
        | LogRecord::Error(args) => format_args_list(args, depth),
        LogRecord::WindowError(error) => format_window_error(error),
        LogRecord::UnhandledRejection(rejection) => format!(
            "{} {}",
            UNHANDLED_REJECTION_MESSAGE,
            format_arg(&rejection.reason, depth)
        ),
    };
    styled(&text, Color::for_level(record.level()))
}

fn format_window_error(error: &WindowError) -> String {
    if let Some(stack) = error.stack.as_deref().filter(|s| !s.is_empty()) {
        return stack.to_string();
    }
    let mut text = error.message.clone();
    if let Some(source) = &error.source {
        text.push_str(&format!(" ({source}"));
        if let Some(line) = error.line {
            text.push_str(&format!(":{line}"));
            if let Some(column) = error.column {
                text.push_str(&format!(":{column}"));
            }
        }
        text.push(')');
    }
    text
}

/// Join console arguments the way `console.log` prints them.
pub fn format_args_list(args: &[Value], depth: u32) -> String {
    args.iter()
        .map(|arg| format_arg(arg, depth))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A top-level argument: strings print raw, everything else is inspected.
pub fn format_arg(value: &Value, depth: u32) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => inspect(other, depth),
    }
}

/// Render a value as a readable literal, collapsing containers nested
/// deeper than `depth`.
pub fn inspect(value: &Value, depth: u32) -> String {
    let mut out = String::new();
    inspect_into(&mut out, value, 0, depth);
    out
}

fn inspect_into(out: &mut String, value: &Value, level: u32, depth: u32) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => quote_into(out, s),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
            } else if level > depth {
                out.push_str("[Array]");
            } else {
                out.push_str("[ ");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    inspect_into(out, item, level + 1, depth);
                }
                out.push_str(" ]");
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
            } else if level > depth {
                out.push_str("[Object]");
            } else {
                out.push_str("{ ");
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if is_identifier(key) {
                        out.push_str(key);
                    } else {
                        quote_into(out, key);
                    }
                    out.push_str(": ");
                    inspect_into(out, item, level + 1, depth);
                }
                out.push_str(" }");
            }
        }
    }
}

fn quote_into(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}
