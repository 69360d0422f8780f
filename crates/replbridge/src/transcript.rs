use std::io::{self, Write as _};

/// Styling class of one transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EntryKind {
    /// Program output and results.
    Output,
    /// Errors, rendered distinctly from normal output.
    Error,
    /// Echo of what the user submitted.
    Input,
    /// Session notices such as "initializing".
    Info,
}

/// Trait for rendering session output.
///
/// Implement this to route the transcript into a UI. [`StdTranscript`] writes
/// to the terminal; [`CollectTranscript`] keeps entries in memory.
pub trait Transcript {
    /// Renders one entry.
    fn print(&mut self, text: &str, kind: EntryKind);

    /// Clears everything rendered so far.
    fn clear(&mut self) {}
}

/// One rendered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub text: String,
}

/// A `Transcript` that keeps every entry in memory.
#[derive(Debug, Default)]
pub struct CollectTranscript(Vec<Entry>);

impl CollectTranscript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.0
    }

    /// Texts of all entries of one kind, in order.
    #[must_use]
    pub fn texts(&self, kind: EntryKind) -> Vec<&str> {
        self.0
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.text.as_str())
            .collect()
    }
}

impl Transcript for CollectTranscript {
    fn print(&mut self, text: &str, kind: EntryKind) {
        self.0.push(Entry {
            kind,
            text: text.to_owned(),
        });
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Terminal transcript: errors to stderr, everything else to stdout.
///
/// Input echoes are skipped since the terminal already shows what was typed.
#[derive(Debug, Default)]
pub struct StdTranscript;

impl Transcript for StdTranscript {
    fn print(&mut self, text: &str, kind: EntryKind) {
        match kind {
            EntryKind::Input => {}
            EntryKind::Error => eprintln!("{text}"),
            EntryKind::Output | EntryKind::Info => println!("{text}"),
        }
    }

    fn clear(&mut self) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(b"\x1b[2J\x1b[H");
        let _ = stdout.flush();
    }
}
