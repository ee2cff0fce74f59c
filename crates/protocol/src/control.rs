//! Control sequences written to terminal displays.
//!
//! Positions passed to these helpers are 1-based, as on the wire.

use crate::log::LogLevel;

/// Control Sequence Introducer.
pub const CSI: &str = "\x1b[";

/// Reset all graphic attributes.
pub const SGR_RESET: &str = "\x1b[0m";

/// Line break written to displays.
pub const CRLF: &str = "\r\n";

/// Erase modes for ED and EL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Erase {
    /// From the cursor to the end.
    Below = 0,
    /// From the start to the cursor.
    Above = 1,
    /// Everything.
    All = 2,
    /// Scrollback (ED only).
    Scrollback = 3,
}

/// CUP: move to row/column.
pub fn cursor_position(row: usize, col: usize) -> String {
    format!("{CSI}{row};{col}H")
}

/// CUU
pub fn cursor_up(n: usize) -> String {
    format!("{CSI}{n}A")
}

/// CUD
pub fn cursor_down(n: usize) -> String {
    format!("{CSI}{n}B")
}

/// CUF
pub fn cursor_forward(n: usize) -> String {
    format!("{CSI}{n}C")
}

/// CUB
pub fn cursor_back(n: usize) -> String {
    format!("{CSI}{n}D")
}

/// CHA: move to column on the current row.
pub fn cursor_column(col: usize) -> String {
    format!("{CSI}{col}G")
}

/// ED
pub fn erase_display(mode: Erase) -> String {
    format!("{CSI}{}J", mode as u8)
}

/// EL
pub fn erase_line(mode: Erase) -> String {
    format!("{CSI}{}K", mode as u8)
}

/// ICH: insert blank cells at the cursor.
pub fn insert_chars(n: usize) -> String {
    format!("{CSI}{n}@")
}

/// DCH: delete cells at the cursor, shifting the rest left.
pub fn delete_chars(n: usize) -> String {
    format!("{CSI}{n}P")
}

/// IL
pub fn insert_lines(n: usize) -> String {
    format!("{CSI}{n}L")
}

/// DL
pub fn delete_lines(n: usize) -> String {
    format!("{CSI}{n}M")
}

/// Foreground colours used by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red = 31,
    Yellow = 33,
    Blue = 34,
    Magenta = 35,
    White = 37,
}

impl Color {
    /// SGR sequence selecting this foreground colour.
    pub fn sgr(self) -> String {
        format!("{CSI}{}m", self as u8)
    }

    /// Colour used for events of the given severity.
    pub fn for_level(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Color::Blue,
            LogLevel::Info => Color::White,
            LogLevel::Warn => Color::Yellow,
            LogLevel::Error => Color::Red,
        }
    }
}

/// Wrap `text` in a colour, resetting afterwards.
pub fn styled(text: &str, color: Color) -> String {
    format!("{}{}{}", color.sgr(), text, SGR_RESET)
}

/// Convert every line break (`\r\n`, `\n` or a lone `\r`) to `\r\n`.
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(CRLF);
            }
            '\n' => out.push_str(CRLF),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_sequences() {
        assert_eq!(cursor_position(1, 1), "\x1b[1;1H");
        assert_eq!(cursor_up(3), "\x1b[3A");
        assert_eq!(cursor_down(2), "\x1b[2B");
        assert_eq!(cursor_forward(4), "\x1b[4C");
        assert_eq!(cursor_back(1), "\x1b[1D");
        assert_eq!(cursor_column(10), "\x1b[10G");
    }

    #[test]
    fn test_erase_sequences() {
        assert_eq!(erase_display(Erase::Below), "\x1b[0J");
        assert_eq!(erase_display(Erase::All), "\x1b[2J");
        assert_eq!(erase_display(Erase::Scrollback), "\x1b[3J");
        assert_eq!(erase_line(Erase::Below), "\x1b[0K");
    }

    #[test]
    fn test_editing_sequences() {
        assert_eq!(insert_chars(2), "\x1b[2@");
        assert_eq!(delete_chars(1), "\x1b[1P");
        assert_eq!(insert_lines(1), "\x1b[1L");
        assert_eq!(delete_lines(1), "\x1b[1M");
    }

    #[test]
    fn test_level_colors() {
        assert_eq!(Color::for_level(LogLevel::Debug), Color::Blue);
        assert_eq!(Color::for_level(LogLevel::Info), Color::White);
        assert_eq!(Color::for_level(LogLevel::Warn), Color::Yellow);
        assert_eq!(Color::for_level(LogLevel::Error), Color::Red);
        assert_eq!(styled("x", Color::Red), "\x1b[31mx\x1b[0m");
    }

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings("a\nb"), "a\r\nb");
        assert_eq!(normalize_line_endings("a\r\nb"), "a\r\nb");
        assert_eq!(normalize_line_endings("a\rb"), "a\r\nb");
        assert_eq!(normalize_line_endings("a\n\nb\r"), "a\r\n\r\nb\r\n");
        assert_eq!(normalize_line_endings(""), "");
    }
}
