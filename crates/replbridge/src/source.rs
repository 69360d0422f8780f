use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// The host editor's current buffer, as far as running it is concerned.
pub trait SourceProvider {
    /// Display name, used for runnable checks and error messages.
    fn name(&self) -> &str;

    /// Full text of the buffer right now.
    fn current_text(&self) -> io::Result<String>;
}

/// A buffer backed by a file on disk, read fresh on every run.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceProvider for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_text(&self) -> io::Result<String> {
        if !fs::metadata(&self.path)?.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a file"));
        }
        fs::read_to_string(&self.path)
    }
}

/// An in-memory buffer.
#[derive(Debug, Clone)]
pub struct TextSource {
    name: String,
    text: String,
}

impl TextSource {
    #[must_use]
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

impl SourceProvider for TextSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_text(&self) -> io::Result<String> {
        Ok(self.text.clone())
    }
}
