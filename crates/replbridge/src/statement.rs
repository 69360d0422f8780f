//! Line-by-line accumulation of interactive REPL input.
//!
//! Mimics an interactive shell's block entry: a line ending in `:` opens a
//! block, indented lines continue it, and a blank line closes it.

/// What a submitted line turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// A blank line with nothing buffered; nothing to do.
    Ignored,
    /// The buffered text is not a complete statement yet.
    Incomplete,
    /// A complete statement: every buffered line, newline-terminated, in order.
    Statement(String),
    /// The answer to a pending runtime input request, without its newline.
    RuntimeInput(String),
}

/// Lines collected since the last completed statement, plus whether the next
/// line answers a runtime input request instead.
#[derive(Debug, Clone, Default)]
pub struct StatementBuffer {
    lines: Vec<String>,
    awaiting_runtime_input: bool,
}

impl StatementBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (with or without its terminator).
    ///
    /// While a runtime input request is pending the line is returned as
    /// [`LineOutcome::RuntimeInput`] and the flag is cleared. Otherwise the
    /// line is buffered and the completeness check decides whether the
    /// buffer is handed out as a statement.
    pub fn push_line(&mut self, line: &str) -> LineOutcome {
        let line = line.trim_end_matches(['\r', '\n']);
        if self.awaiting_runtime_input {
            self.clear();
            return LineOutcome::RuntimeInput(line.to_owned());
        }
        if self.lines.is_empty() && line.trim().is_empty() {
            return LineOutcome::Ignored;
        }

        self.lines.push(format!("{line}\n"));
        let source = self.pending_source();
        if is_incomplete(&source) {
            LineOutcome::Incomplete
        } else {
            self.clear();
            LineOutcome::Statement(source)
        }
    }

    /// The buffered text so far.
    #[must_use]
    pub fn pending_source(&self) -> String {
        self.lines.concat()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[must_use]
    pub fn is_awaiting_runtime_input(&self) -> bool {
        self.awaiting_runtime_input
    }

    /// Marks whether the next line answers a runtime input request.
    pub fn set_awaiting_runtime_input(&mut self, awaiting: bool) {
        self.awaiting_runtime_input = awaiting;
    }

    /// Drops buffered lines and any pending runtime input request.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.awaiting_runtime_input = false;
    }
}

/// Heuristic block-end detector, applied to the last line of the trimmed
/// source.
///
/// - a trailing `:` expects an indented block, so the source is incomplete;
/// - an indented last line continues a block unless the raw source already
///   ends with a blank line (`"\n\n"`), which closes it;
/// - anything else is complete.
///
/// This approximates block structure: a statement that starts with
/// whitespace for other reasons can be misclassified.
#[must_use]
pub fn is_incomplete(source: &str) -> bool {
    let last_line = source.trim().lines().last().unwrap_or_default();
    if last_line.ends_with(':') {
        return true;
    }
    if last_line.starts_with(char::is_whitespace) {
        return !source.ends_with("\n\n");
    }
    false
}
