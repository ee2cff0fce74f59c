//! Preparing console input for evaluation.
//!
//! Input runs as the body of an async function. When its last statement is
//! a bare expression, that expression is rewritten to `return [( … )]` so
//! its value can be echoed. The inserted characters are recorded so
//! positions reported by the engine can be mapped back to what the user
//! typed.

use std::sync::LazyLock;

use oxc_allocator::Allocator;
use oxc_ast::ast::Statement;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::{GetSpan, SourceType};
use regex::{Captures, Regex};

/// Name under which evaluated code sees the console context.
pub const CONTEXT_NAME: &str = "$$";

/// Script name positions are reported against after mapping.
pub const CONSOLE_SOURCE_NAME: &str = "<console>";

const RETURN_PREFIX: &str = "return [(";
const RETURN_SUFFIX: &str = ")]";

/// Lines added above the user's code by [`wrap_async`].
const WRAPPER_LINES: u32 = 1;

/// Prefix of the console's own helper functions. Their frames are dropped
/// from stack traces.
pub const HELPER_PREFIX: &str = "__paneterm_";

/// Engine positions, as they appear in stack traces and syntax errors.
static POSITION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:eval_script|<input>|<evalScript>):(\d+)(?::(\d+))?").ok());

/// A single inserted character, by line (1-based) and column (0-based, in
/// characters) of the rewritten source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Insertion {
    pub line: u32,
    pub column: u32,
}

/// Characters inserted by a rewrite, to be deleted when mapping positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDeletions {
    insertions: Vec<Insertion>,
}

impl SourceDeletions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.insertions.len()
    }

    /// Record `count` characters inserted at `line`/`column`.
    pub fn insert(&mut self, line: u32, column: u32, count: u32) {
        self.insertions
            .extend((0..count).map(|i| Insertion { line, column: column + i }));
        self.insertions.sort_unstable();
    }

    /// Map a rewritten-source position back to the original source.
    ///
    /// Inserted text never contains line breaks, so only columns move.
    pub fn map(&self, line: u32, column: u32) -> (u32, u32) {
        let shifted = self
            .insertions
            .iter()
            .filter(|i| i.line == line && i.column < column)
            .count() as u32;
        (line, column - shifted)
    }
}

/// Input after the echo rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub source: String,
    pub deletions: SourceDeletions,
}

/// Rewrite `code` so the value of its trailing expression is returned.
///
/// `None` when the input does not parse or does not end in an expression
/// statement; the input is then run as written.
pub fn prepare(code: &str) -> Option<Rewrite> {
    let allocator = Allocator::default();
    let options = ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    };
    let parsed = Parser::new(&allocator, code, SourceType::mjs())
        .with_options(options)
        .parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        return None;
    }

    // A lone string literal parses as a directive, not a statement.
    let program = &parsed.program;
    let span = match program.body.last() {
        Some(Statement::ExpressionStatement(statement)) => statement.expression.span(),
        Some(_) => return None,
        None => program.directives.last()?.expression.span,
    };
    let (start, end) = (span.start as usize, span.end as usize);
    if start >= end || end > code.len() {
        return None;
    }

    let mut source = String::with_capacity(code.len() + RETURN_PREFIX.len() + RETURN_SUFFIX.len());
    source.push_str(&code[..start]);
    source.push_str(RETURN_PREFIX);
    source.push_str(&code[start..end]);
    source.push_str(RETURN_SUFFIX);
    source.push_str(&code[end..]);

    let prefix_len = RETURN_PREFIX.chars().count() as u32;
    let (start_line, start_column) = position_of(code, start);
    let (end_line, mut end_column) = position_of(code, end);
    if end_line == start_line {
        end_column += prefix_len;
    }

    let mut deletions = SourceDeletions::new();
    deletions.insert(start_line, start_column, prefix_len);
    deletions.insert(end_line, end_column, RETURN_SUFFIX.chars().count() as u32);
    Some(Rewrite { source, deletions })
}

/// Line (1-based) and character column (0-based) of a byte offset.
fn position_of(code: &str, offset: usize) -> (u32, u32) {
    let before = &code[..offset];
    let line = before.matches('\n').count() as u32 + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before[line_start..].chars().count() as u32;
    (line, column)
}

/// Wrap a function body so it runs with the console context in scope.
pub fn wrap_async(body: &str) -> String {
    format!("(async function ({CONTEXT_NAME}) {{\n{body}\n}})")
}

/// Rewrite engine positions in `text` (a stack trace or error message) to
/// positions in the user's input.
///
/// Frames of the console's helpers share the engine's script name with the
/// user's code, so they are removed first.
pub fn remap_positions(text: &str, deletions: &SourceDeletions) -> String {
    let helper_frame = format!("at {HELPER_PREFIX}");
    let text = text
        .lines()
        .filter(|line| !line.trim_start().starts_with(&helper_frame))
        .collect::<Vec<_>>()
        .join("\n");
    let Some(position) = POSITION.as_ref() else {
        return text;
    };
    position
        .replace_all(&text, |caps: &Captures<'_>| {
            let line: u32 = caps[1].parse().unwrap_or(0);
            let line = line.saturating_sub(WRAPPER_LINES).max(1);
            match caps.get(2).and_then(|c| c.as_str().parse::<u32>().ok()) {
                Some(column) => {
                    let (line, column) = deletions.map(line, column.saturating_sub(1));
                    format!("{CONSOLE_SOURCE_NAME}:{line}:{}", column + 1)
                }
                None => format!("{CONSOLE_SOURCE_NAME}:{line}"),
            }
        })
        .into_owned()
}
