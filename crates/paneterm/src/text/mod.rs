//! Editable text with a cursor, and how it lays out on a display.

mod text_area;

use unicode_width::UnicodeWidthChar;

pub use text_area::{TerminalTextArea, MARGIN};

/// Text with a cursor position (a byte offset on a char boundary).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursoredText {
    pub text: String,
    pub cursor: usize,
}

/// How a [`CursoredText`] wraps on a display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLayout {
    /// Display width used for wrapping.
    pub cols: u16,
    /// Column the first row starts at.
    pub start_x: usize,
    /// Row contents after wrapping. The first row excludes the `start_x` prefix.
    pub lines: Vec<String>,
    /// Number of rows (`lines.len()`).
    pub rows: usize,
    /// Cursor `(x, y)`, `y` relative to the first row.
    pub cursor: (usize, usize),
    /// Column just past the last character.
    pub end_x: usize,
}

impl CursoredText {
    /// Create text with the cursor at `cursor`, clamped to a char boundary.
    pub fn new(text: impl Into<String>, cursor: usize) -> Self {
        let text = text.into();
        let mut cursor = cursor.min(text.len());
        while !text.is_char_boundary(cursor) {
            cursor -= 1;
        }
        Self { text, cursor }
    }

    /// Text with the cursor at the end.
    pub fn at_end(text: impl Into<String>) -> Self {
        let text = text.into();
        let cursor = text.len();
        Self { text, cursor }
    }

    pub fn before(&self) -> &str {
        &self.text[..self.cursor]
    }

    pub fn after(&self) -> &str {
        &self.text[self.cursor..]
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Lay the text out on a display `cols` wide, starting at column
    /// `start_x`, the way a terminal with auto-wrap would: a character
    /// that does not fit moves whole to the next row, `\n` starts a row.
    pub fn layout(&self, cols: u16, start_x: usize) -> TextLayout {
        let width = usize::from(cols.max(1));
        let start_x = start_x.min(width);
        let mut lines = vec![String::new()];
        let mut x = start_x;
        let mut cursor = None;

        for (index, c) in self.text.char_indices() {
            if index == self.cursor {
                cursor = Some((x, lines.len() - 1));
            }
            if c == '\n' {
                lines.push(String::new());
                x = 0;
                continue;
            }
            let Some(w) = c.width() else {
                continue;
            };
            if w > 0 && x + w > width {
                lines.push(String::new());
                x = 0;
            }
            if let Some(line) = lines.last_mut() {
                line.push(c);
            }
            x += w;
        }

        let rows = lines.len();
        TextLayout {
            cols,
            start_x,
            cursor: cursor.unwrap_or((x, rows - 1)),
            end_x: x,
            lines,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clamps_cursor() {
        let text = CursoredText::new("héllo", 2);
        assert_eq!(text.cursor, 1);
        assert_eq!(CursoredText::new("ab", 10).cursor, 2);
        assert_eq!(CursoredText::at_end("abc").cursor, 3);
    }

    #[test]
    fn test_before_after() {
        let text = CursoredText::new("hello", 2);
        assert_eq!(text.before(), "he");
        assert_eq!(text.after(), "llo");
    }

    #[test]
    fn test_layout_single_row() {
        let layout = CursoredText::new("abc", 1).layout(10, 0);
        assert_eq!(layout.lines, vec!["abc"]);
        assert_eq!(layout.rows, 1);
        assert_eq!(layout.cursor, (1, 0));
        assert_eq!(layout.end_x, 3);
    }

    #[test]
    fn test_layout_wraps_after_start_offset() {
        // "> " prompt occupies two columns.
        let layout = CursoredText::at_end("abcdef").layout(5, 2);
        assert_eq!(layout.lines, vec!["abc", "def"]);
        assert_eq!(layout.rows, 2);
        assert_eq!(layout.cursor, (3, 1));
        assert_eq!(layout.start_x, 2);
    }

    #[test]
    fn test_layout_newlines() {
        let layout = CursoredText::new("ab\ncd", 3).layout(80, 4);
        assert_eq!(layout.lines, vec!["ab", "cd"]);
        assert_eq!(layout.cursor, (0, 1));
        assert_eq!(layout.end_x, 2);
    }

    #[test]
    fn test_layout_wide_character_wraps_whole() {
        let layout = CursoredText::at_end("ab日").layout(3, 0);
        assert_eq!(layout.lines, vec!["ab", "日"]);
        assert_eq!(layout.cursor, (2, 1));
    }

    #[test]
    fn test_layout_exact_fit_keeps_pending_wrap() {
        let layout = CursoredText::at_end("abc").layout(3, 0);
        assert_eq!(layout.rows, 1);
        assert_eq!(layout.cursor, (3, 0));
    }

    #[test]
    fn test_layout_empty() {
        let layout = CursoredText::default().layout(80, 7);
        assert_eq!(layout.lines, vec![""]);
        assert_eq!(layout.rows, 1);
        assert_eq!(layout.cursor, (7, 0));
    }
}
