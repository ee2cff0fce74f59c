//! Input history for the console prompt.

/// Submitted inputs plus the entry being edited.
///
/// The last entry always mirrors the in-progress buffer. Navigation moves
/// an index around the whole list, wrapping at both ends, so stepping past
/// the oldest entry lands back on the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleHistory {
    entries: Vec<String>,
    index: usize,
}

impl Default for ConsoleHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleHistory {
    pub fn new() -> Self {
        Self {
            entries: vec![String::new()],
            index: 0,
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the draft entry is never removed.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The in-progress entry.
    pub fn draft(&self) -> &str {
        self.entries.last().map(String::as_str).unwrap_or_default()
    }

    /// Mirror the edit buffer into the draft entry.
    pub fn set_draft(&mut self, text: &str) {
        if let Some(last) = self.entries.last_mut() {
            if last != text {
                last.clear();
                last.push_str(text);
            }
        }
    }

    /// Replace the draft with `code` and start a fresh, empty draft.
    pub fn commit(&mut self, code: &str) {
        let last = self.entries.len() - 1;
        self.entries.splice(last.., [code.to_string(), String::new()]);
        self.index = last + 1;
    }

    /// Whether arrow-key navigation is currently allowed. A draft spanning
    /// several lines keeps the arrows for cursor movement.
    pub fn can_navigate(&self) -> bool {
        !self.draft().contains('\n')
    }

    /// Step backwards, returning the entry to show.
    pub fn previous(&mut self) -> Option<&str> {
        self.step(self.entries.len() - 1)
    }

    /// Step forwards, returning the entry to show.
    pub fn next(&mut self) -> Option<&str> {
        self.step(1)
    }

    fn step(&mut self, by: usize) -> Option<&str> {
        if !self.can_navigate() {
            return None;
        }
        self.index = (self.index + by) % self.entries.len();
        Some(&self.entries[self.index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_empty_draft() {
        let history = ConsoleHistory::new();
        assert_eq!(history.entries(), [""]);
        assert_eq!(history.index(), 0);
        assert_eq!(history.draft(), "");
    }

    #[test]
    fn test_commit_splits_draft() {
        let mut history = ConsoleHistory::new();
        history.set_draft("1 + 1");
        history.commit("1 + 1");
        assert_eq!(history.entries(), ["1 + 1", ""]);
        assert_eq!(history.index(), 1);

        history.commit("x");
        assert_eq!(history.entries(), ["1 + 1", "x", ""]);
        assert_eq!(history.index(), 2);
    }

    #[test]
    fn test_navigation_wraps() {
        let mut history = ConsoleHistory::new();
        history.commit("a");
        history.commit("b");

        assert_eq!(history.previous(), Some("b"));
        assert_eq!(history.previous(), Some("a"));
        assert_eq!(history.previous(), Some(""));
        assert_eq!(history.previous(), Some("b"));
        assert_eq!(history.next(), Some(""));
        assert_eq!(history.next(), Some("a"));
    }

    #[test]
    fn test_navigation_round_trip_restores_draft() {
        for committed in 0..5 {
            let mut history = ConsoleHistory::new();
            for i in 0..committed {
                history.commit(&format!("entry {i}"));
            }
            history.set_draft("draft");

            let steps = committed;
            for _ in 0..steps {
                history.previous().unwrap();
            }
            for _ in 0..steps {
                history.next().unwrap();
            }
            assert_eq!(history.index(), history.len() - 1, "{committed} entries");
            assert_eq!(history.entries()[history.index()], "draft");

            // A full lap in either direction also ends on the draft.
            for _ in 0..history.len() {
                history.previous().unwrap();
            }
            assert_eq!(history.entries()[history.index()], "draft");
            for _ in 0..history.len() {
                history.next().unwrap();
            }
            assert_eq!(history.entries()[history.index()], "draft");
        }
    }

    #[test]
    fn test_multiline_draft_blocks_navigation() {
        let mut history = ConsoleHistory::new();
        history.commit("a");
        history.set_draft("if (x) {\n");
        assert!(!history.can_navigate());
        assert_eq!(history.previous(), None);
        assert_eq!(history.index(), 1);

        history.set_draft("if (x) {");
        assert_eq!(history.previous(), Some("a"));
    }

    #[test]
    fn test_single_entry_navigation_stays_put() {
        let mut history = ConsoleHistory::new();
        assert_eq!(history.previous(), Some(""));
        assert_eq!(history.next(), Some(""));
        assert_eq!(history.index(), 0);
    }
}
