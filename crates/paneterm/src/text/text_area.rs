//! A multi-line input buffer edited through a virtual terminal.
//!
//! Input is replayed into a private `vt100` screen using insert/delete
//! control sequences, and the logical value is read back from the cells.
//! The screen is always kept wider than the longest line and taller than
//! the line count, so no row ever soft-wraps: row `n` is line `n`.

use protocol::control::{
    cursor_back, cursor_position, delete_chars, delete_lines, erase_line, insert_chars,
    insert_lines, Erase,
};
use unicode_width::UnicodeWidthChar;
use vt100::Parser;

use super::CursoredText;

/// Spare columns and rows kept around the content (the widest character).
pub const MARGIN: u16 = 2;

/// Longest escape sequence body buffered before it is discarded.
const MAX_ESCAPE_LENGTH: usize = 32;

/// Editing actions reachable through escape sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    DeleteForward,
}

enum EscapeParse {
    Incomplete,
    Done(Option<Motion>),
}

/// Line editor backed by a virtual terminal buffer.
pub struct TerminalTextArea {
    parser: Parser,
    /// Display width of each line.
    widths: Vec<u16>,
    value: CursoredText,
    /// Body of an escape sequence in progress (after ESC).
    escape: Option<String>,
    last_x: u16,
    last_was_cr: bool,
}

impl Default for TerminalTextArea {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalTextArea {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(1 + MARGIN, MARGIN, 0),
            widths: vec![0],
            value: CursoredText::default(),
            escape: None,
            last_x: 0,
            last_was_cr: false,
        }
    }

    /// Current value and cursor.
    pub fn value(&self) -> &CursoredText {
        &self.value
    }

    /// Text before and after the cursor.
    pub fn values(&self) -> (String, String) {
        (
            self.value.before().to_string(),
            self.value.after().to_string(),
        )
    }

    /// The logical lines.
    pub fn lines(&self) -> Vec<String> {
        self.value.text.split('\n').map(str::to_string).collect()
    }

    /// Cursor `(x, y)` in cells and lines.
    pub fn cursor(&self) -> (u16, u16) {
        let (row, col) = self.parser.screen().cursor_position();
        (col, row)
    }

    /// Process typed or pasted input.
    pub fn write(&mut self, data: &str) {
        for c in data.chars() {
            self.process(c);
            self.clamp_cursor();
        }
        self.rebuild_value();
        self.fit();
    }

    /// Reset to a single empty line, returning the previous value.
    pub fn clear(&mut self) -> CursoredText {
        let previous = std::mem::take(&mut self.value);
        *self = Self::new();
        previous
    }

    /// Replace the contents; the cursor ends up after the text.
    pub fn set_value(&mut self, text: &str) {
        self.clear();
        self.write(text);
    }

    fn process(&mut self, c: char) {
        let after_cr = std::mem::replace(&mut self.last_was_cr, c == '\r');

        if let Some(mut body) = self.escape.take() {
            body.push(c);
            match parse_escape(&body) {
                EscapeParse::Incomplete => self.escape = Some(body),
                EscapeParse::Done(Some(motion)) => self.apply(motion),
                EscapeParse::Done(None) => {}
            }
            return;
        }

        match c {
            '\x1b' => self.escape = Some(String::new()),
            '\x7f' => self.backspace(),
            '\n' if after_cr => {}
            '\r' | '\n' => self.new_line(),
            c if c.is_control() => {}
            c => self.insert_char(c),
        }
    }

    fn apply(&mut self, motion: Motion) {
        let (x, y) = self.cursor();
        match motion {
            Motion::Up if y > 0 => self.move_to(x, y - 1),
            Motion::Down if usize::from(y) + 1 < self.widths.len() => self.move_to(x, y + 1),
            Motion::Left if x > 0 => {
                let w = self.width_before(x, y);
                self.move_to(x - w, y);
            }
            Motion::Right if x < self.width(y) => {
                let w = self.width_at(x, y);
                self.move_to(x + w, y);
            }
            Motion::Home => self.move_to(0, y),
            Motion::End => self.move_to(self.width(y), y),
            Motion::DeleteForward => self.delete_forward(),
            _ => {}
        }
    }

    fn feed(&mut self, seq: &str) {
        self.parser.process(seq.as_bytes());
    }

    fn move_to(&mut self, x: u16, y: u16) {
        self.feed(&cursor_position(usize::from(y) + 1, usize::from(x) + 1));
    }

    fn width(&self, y: u16) -> u16 {
        self.widths.get(usize::from(y)).copied().unwrap_or(0)
    }

    fn is_continuation(&self, x: u16, y: u16) -> bool {
        self.parser
            .screen()
            .cell(y, x)
            .is_some_and(|cell| cell.is_wide_continuation())
    }

    /// Width of the character ending just left of column `x`.
    fn width_before(&self, x: u16, y: u16) -> u16 {
        if x >= 2 && self.is_continuation(x - 1, y) {
            2
        } else {
            1
        }
    }

    /// Width of the character starting at column `x`.
    fn width_at(&self, x: u16, y: u16) -> u16 {
        let wide = self
            .parser
            .screen()
            .cell(y, x)
            .is_some_and(|cell| cell.is_wide());
        if wide {
            2
        } else {
            1
        }
    }

    /// Text of row `y` between columns `from` and `to`.
    fn row_text(&self, y: u16, from: u16, to: u16) -> String {
        let screen = self.parser.screen();
        let mut text = String::new();
        for col in from..to {
            match screen.cell(y, col) {
                Some(cell) if cell.is_wide_continuation() => {}
                Some(cell) if cell.has_contents() => text.push_str(&cell.contents()),
                _ => text.push(' '),
            }
        }
        text
    }

    /// Grow the screen so `extra_cols` more cells fit on the longest line
    /// and `extra_rows` more lines fit below the last.
    fn ensure_size(&mut self, extra_cols: u16, extra_rows: u16) {
        let longest = self.widths.iter().copied().max().unwrap_or(0);
        let cols = longest
            .saturating_add(extra_cols)
            .saturating_add(MARGIN);
        let rows = u16::try_from(self.widths.len())
            .unwrap_or(u16::MAX)
            .saturating_add(extra_rows)
            .saturating_add(MARGIN);
        let (current_rows, current_cols) = self.parser.screen().size();
        if cols > current_cols || rows > current_rows {
            self.parser
                .set_size(rows.max(current_rows), cols.max(current_cols));
        }
    }

    /// Shrink or grow the screen to exactly fit the content.
    fn fit(&mut self) {
        let longest = self.widths.iter().copied().max().unwrap_or(0);
        let rows = u16::try_from(self.widths.len()).unwrap_or(u16::MAX);
        self.parser
            .set_size(rows.saturating_add(MARGIN), longest.saturating_add(MARGIN));
    }

    fn insert_char(&mut self, c: char) {
        let Some(width) = c.width() else {
            return;
        };
        let (x, y) = self.cursor();
        if width == 0 {
            // Combining marks attach to the character left of the cursor.
            if x > 0 {
                self.feed(c.encode_utf8(&mut [0; 4]));
            }
            return;
        }
        let width = width as u16;
        self.ensure_size(width, 0);
        self.feed(&insert_chars(usize::from(width)));
        self.feed(c.encode_utf8(&mut [0; 4]));
        if let Some(line) = self.widths.get_mut(usize::from(y)) {
            *line = line.saturating_add(width);
        }
    }

    /// Split the line at the cursor, carrying the rest onto a new line.
    fn new_line(&mut self) {
        let (x, y) = self.cursor();
        let rest = self.row_text(y, x, self.width(y));
        self.ensure_size(0, 1);
        self.feed(&erase_line(Erase::Below));
        let index = usize::from(y);
        self.widths[index] = x;
        self.widths.insert(index + 1, 0);
        self.move_to(0, y + 1);
        self.feed(&insert_lines(1));
        self.move_to(0, y + 1);
        for c in rest.chars() {
            self.insert_char(c);
        }
        self.move_to(0, y + 1);
    }

    /// Erase left of the cursor, joining with the previous line at column 0.
    fn backspace(&mut self) {
        let (x, y) = self.cursor();
        if x > 0 {
            let w = self.width_before(x, y);
            self.feed(&cursor_back(usize::from(w)));
            self.feed(&delete_chars(usize::from(w)));
            let index = usize::from(y);
            self.widths[index] = self.widths[index].saturating_sub(w);
        } else if y > 0 {
            let rest = self.row_text(y, 0, self.width(y));
            let boundary = self.width(y - 1);
            self.feed(&delete_lines(1));
            self.widths.remove(usize::from(y));
            self.move_to(boundary, y - 1);
            for c in rest.chars() {
                self.insert_char(c);
            }
            self.move_to(boundary, y - 1);
        }
    }

    /// Erase right of the cursor, joining with the next line at the end.
    fn delete_forward(&mut self) {
        let (x, y) = self.cursor();
        let index = usize::from(y);
        if x < self.width(y) {
            let w = self.width_at(x, y);
            self.feed(&delete_chars(usize::from(w)));
            self.widths[index] = self.widths[index].saturating_sub(w);
        } else if index + 1 < self.widths.len() {
            let rest = self.row_text(y + 1, 0, self.width(y + 1));
            self.move_to(0, y + 1);
            self.feed(&delete_lines(1));
            self.widths.remove(index + 1);
            self.move_to(x, y);
            for c in rest.chars() {
                self.insert_char(c);
            }
            self.move_to(x, y);
        }
    }

    /// Keep the cursor inside the content and off wide-character tails.
    fn clamp_cursor(&mut self) {
        let (cx, cy) = self.cursor();
        let last_line = u16::try_from(self.widths.len() - 1).unwrap_or(u16::MAX);
        let y = cy.min(last_line);
        let mut x = cx.min(self.width(y));
        if x > 0 && x < self.width(y) && self.is_continuation(x, y) {
            if x > self.last_x {
                x += 1;
            } else {
                x -= 1;
            }
        }
        if (x, y) != (cx, cy) {
            self.move_to(x, y);
        }
        self.last_x = x;
    }

    /// Read every line back from the screen.
    fn rebuild_value(&mut self) {
        let (x, y) = self.cursor();
        let mut before = String::new();
        for row in 0..y {
            before.push_str(&self.row_text(row, 0, self.width(row)));
            before.push('\n');
        }
        before.push_str(&self.row_text(y, 0, x));

        let mut after = self.row_text(y, x, self.width(y));
        let rows = u16::try_from(self.widths.len()).unwrap_or(u16::MAX);
        for row in (y + 1)..rows {
            after.push('\n');
            after.push_str(&self.row_text(row, 0, self.width(row)));
        }

        let cursor = before.len();
        before.push_str(&after);
        self.value = CursoredText {
            text: before,
            cursor,
        };
    }
}

/// Parse the body of an escape sequence (the bytes after ESC).
fn parse_escape(body: &str) -> EscapeParse {
    let mut chars = body.chars();
    let Some(intro) = chars.next() else {
        return EscapeParse::Incomplete;
    };
    match intro {
        '[' => {
            let rest = chars.as_str();
            let Some(last) = rest.chars().last() else {
                return EscapeParse::Incomplete;
            };
            if ('\x40'..='\x7e').contains(&last) {
                let params = &rest[..rest.len() - last.len_utf8()];
                EscapeParse::Done(csi_motion(params, last))
            } else if rest.len() > MAX_ESCAPE_LENGTH {
                EscapeParse::Done(None)
            } else {
                EscapeParse::Incomplete
            }
        }
        'O' => match chars.next() {
            None => EscapeParse::Incomplete,
            Some(last) => EscapeParse::Done(csi_motion("", last)),
        },
        _ => EscapeParse::Done(None),
    }
}

fn csi_motion(params: &str, last: char) -> Option<Motion> {
    match last {
        'A' => Some(Motion::Up),
        'B' => Some(Motion::Down),
        'C' => Some(Motion::Right),
        'D' => Some(Motion::Left),
        'H' => Some(Motion::Home),
        'F' => Some(Motion::End),
        '~' => match params.split(';').next() {
            Some("1") | Some("7") => Some(Motion::Home),
            Some("4") | Some("8") => Some(Motion::End),
            Some("3") => Some(Motion::DeleteForward),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(input: &str) -> TerminalTextArea {
        let mut area = TerminalTextArea::new();
        area.write(input);
        area
    }

    #[test]
    fn test_plain_typing() {
        let area = area("hello");
        assert_eq!(area.value(), &CursoredText::at_end("hello"));
        assert_eq!(area.cursor(), (5, 0));
    }

    #[test]
    fn test_newline_commits_line() {
        let area = area("a\nb");
        assert_eq!(area.lines(), vec!["a", "b"]);
        assert_eq!(area.values(), ("a\nb".to_string(), String::new()));
    }

    #[test]
    fn test_crlf_is_one_line_break() {
        assert_eq!(area("a\r\nb").lines(), vec!["a", "b"]);
        assert_eq!(area("a\rb").lines(), vec!["a", "b"]);
        assert_eq!(area("a\n\nb").lines(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_backspace_at_line_start_merges() {
        let mut area = area("a\nb");
        area.write("\x1b[D");
        assert_eq!(area.cursor(), (0, 1));
        area.write("\x7f");
        assert_eq!(area.value(), &CursoredText::new("ab", 1));
        assert_eq!(area.lines(), vec!["ab"]);
    }

    #[test]
    fn test_backspace_in_line() {
        let mut area = area("abc");
        area.write("\x1b[D\x7f");
        assert_eq!(area.value(), &CursoredText::new("ac", 1));
    }

    #[test]
    fn test_backspace_at_origin_is_noop() {
        let area = area("\x7f\x7f");
        assert_eq!(area.value(), &CursoredText::default());
    }

    #[test]
    fn test_insert_in_middle() {
        let mut area = area("ac");
        area.write("\x1b[Db");
        assert_eq!(area.value(), &CursoredText::new("abc", 2));
    }

    #[test]
    fn test_enter_in_middle_splits_line() {
        let mut area = area("hello");
        area.write("\x1b[D\x1b[D\r");
        assert_eq!(area.lines(), vec!["hel", "lo"]);
        assert_eq!(area.cursor(), (0, 1));
        assert_eq!(area.values(), ("hel\n".to_string(), "lo".to_string()));
    }

    #[test]
    fn test_vertical_motion_clamps_to_line_width() {
        let mut area = area("abcdef\nxy");
        area.write("\x1b[A");
        assert_eq!(area.cursor(), (2, 0));
        area.write("\x1b[F\x1b[B");
        assert_eq!(area.cursor(), (2, 1));
    }

    #[test]
    fn test_motion_stops_at_edges() {
        let mut area = area("ab");
        area.write("\x1b[C\x1b[C\x1b[B");
        assert_eq!(area.cursor(), (2, 0));
        area.write("\x1b[H\x1b[D\x1b[A");
        assert_eq!(area.cursor(), (0, 0));
    }

    #[test]
    fn test_ss3_cursor_keys() {
        let mut area = area("ab");
        area.write("\x1bOD");
        assert_eq!(area.cursor(), (1, 0));
        area.write("\x1bOH");
        assert_eq!(area.cursor(), (0, 0));
    }

    #[test]
    fn test_tilde_home_end() {
        let mut area = area("abc");
        area.write("\x1b[1~");
        assert_eq!(area.cursor(), (0, 0));
        area.write("\x1b[4~");
        assert_eq!(area.cursor(), (3, 0));
    }

    #[test]
    fn test_forward_delete() {
        let mut area = area("abc");
        area.write("\x1b[H\x1b[3~");
        assert_eq!(area.value(), &CursoredText::new("bc", 0));
    }

    #[test]
    fn test_forward_delete_at_line_end_joins_next_line() {
        let mut area = area("ab\ncd");
        area.write("\x1b[A\x1b[F\x1b[3~");
        assert_eq!(area.value(), &CursoredText::new("abcd", 2));
    }

    #[test]
    fn test_unknown_escapes_are_swallowed() {
        let area = area("a\x1b[5~b\x1b[31mc\x1bxd");
        assert_eq!(area.value(), &CursoredText::at_end("abcd"));
    }

    #[test]
    fn test_escape_split_across_writes() {
        let mut area = area("ab\x1b");
        area.write("[");
        area.write("D");
        assert_eq!(area.cursor(), (1, 0));
        assert_eq!(area.value().text, "ab");
    }

    #[test]
    fn test_control_characters_ignored() {
        let area = area("a\tb\x07c");
        assert_eq!(area.value().text, "abc");
    }

    #[test]
    fn test_wide_characters() {
        let mut area = area("日本");
        assert_eq!(area.cursor(), (4, 0));
        area.write("\x1b[D");
        assert_eq!(area.cursor(), (2, 0));
        area.write("\x7f");
        assert_eq!(area.value(), &CursoredText::new("本", 0));
    }

    #[test]
    fn test_vertical_motion_snaps_off_wide_tail() {
        let mut area = area("日本\nabc");
        area.write("\x1b[D\x1b[D\x1b[A");
        // Column 1 is the tail of 日; the cursor moves back onto its start.
        assert_eq!(area.cursor(), (0, 0));
    }

    #[test]
    fn test_clear_returns_previous_value() {
        let mut area = area("x\ny");
        let previous = area.clear();
        assert_eq!(previous, CursoredText::at_end("x\ny"));
        assert_eq!(area.value(), &CursoredText::default());
        assert_eq!(area.lines(), vec![""]);
    }

    #[test]
    fn test_set_value() {
        let mut area = area("old");
        area.set_value("new\nvalue");
        assert_eq!(area.value(), &CursoredText::at_end("new\nvalue"));
    }

    #[test]
    fn test_long_line_never_wraps() {
        let text = "x".repeat(300);
        let area = area(&text);
        assert_eq!(area.lines(), vec![text.clone()]);
        assert_eq!(area.cursor(), (300, 0));
    }
}
