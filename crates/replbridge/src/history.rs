//! Recall of previously submitted statements.

/// Direction of a history recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recall {
    /// Towards older entries (arrow up).
    Previous,
    /// Towards newer entries and finally the empty "new" slot (arrow down).
    Next,
}

/// Position of the text cursor within a multi-line input area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorLine {
    /// 1-based line the cursor sits on.
    pub line: usize,
    /// Number of lines in the input area.
    pub line_count: usize,
}

impl CursorLine {
    /// Locates the cursor from a selection range given as byte offsets.
    ///
    /// Returns `None` when text is selected (start != end) or the offset is
    /// not on a character boundary: no navigation happens then.
    #[must_use]
    pub fn locate(text: &str, selection_start: usize, selection_end: usize) -> Option<Self> {
        if selection_start != selection_end {
            return None;
        }
        let before = text.get(..selection_start)?;
        Some(Self {
            line: before.split('\n').count(),
            line_count: text.split('\n').count(),
        })
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        self.line == 1
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.line == self.line_count
    }
}

/// Append-only list of submitted statements with a recall cursor.
///
/// The cursor ranges over `0..=len()`; `len()` is the empty "new entry" slot
/// and is where the cursor goes after every push.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    entries: Vec<String>,
    cursor: usize,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a statement and resets the cursor to the new-entry slot.
    pub fn push(&mut self, text: impl Into<String>) {
        self.entries.push(text.into());
        self.cursor = self.entries.len();
    }

    /// Steps back one entry. Returns `None` at the oldest entry.
    pub fn prev(&mut self) -> Option<&str> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor).map(String::as_str)
    }

    /// Steps forward one entry; stepping onto the new-entry slot yields `""`.
    /// Returns `None` when already on the new-entry slot.
    #[expect(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&str> {
        if self.cursor >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        Some(self.entries.get(self.cursor).map_or("", String::as_str))
    }

    /// Recalls in `direction`, but only from the first line (for
    /// [`Recall::Previous`]) or last line (for [`Recall::Next`]) of the
    /// input area, so arrow keys still move between lines of a multi-line
    /// statement.
    pub fn recall(&mut self, direction: Recall, cursor: Option<CursorLine>) -> Option<&str> {
        let cursor = cursor?;
        match direction {
            Recall::Previous if cursor.is_first() => self.prev(),
            Recall::Next if cursor.is_last() => self.next(),
            _ => None,
        }
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}
