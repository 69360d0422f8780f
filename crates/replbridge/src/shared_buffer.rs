//! The shared input buffer: the only channel that carries data *into* a
//! worker without an asynchronous message.
//!
//! The controller writes; the worker performs bounded blocking reads. Content
//! is a structured [`BufferContent`] rather than a string with a reserved
//! separator character, so a submitted line can contain anything.
//!
//! | Buffer | Reachable from | Read strategy |
//! |--------|----------------|---------------|
//! | [`MemoryBuffer`] | the same process | condition variable (true suspend/resume) |
//! | [`FileBuffer`] | any process, by `file://` URL | polling |

use std::{
    fmt,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use url::Url;
use uuid::Uuid;

use crate::{config::DEFAULT_POLL_INTERVAL_MS, error::BufferError};

/// What the shared buffer currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BufferContent {
    /// Nothing submitted since the last clear.
    #[default]
    Empty,
    /// The session was torn down; any blocked reader must give up.
    Closed,
    /// One submitted line, stamped with the input request it answers and the
    /// controller's submission counter.
    Line { request: u64, sequence: u64, text: String },
}

impl BufferContent {
    /// Returns true if a reader that last consumed `after` should accept this
    /// content: a strictly newer line, or the closed marker.
    #[must_use]
    pub fn is_newer_than(&self, after: Option<u64>) -> bool {
        match self {
            Self::Empty => false,
            Self::Closed => true,
            Self::Line { sequence, .. } => after.is_none_or(|seen| *sequence > seen),
        }
    }

    /// Decodes stored bytes. Empty or unparsable storage reads as `Empty`:
    /// a reader may observe a half-written or foreign value and must not
    /// mistake it for input.
    #[must_use]
    pub fn decode(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        serde_json::from_str(trimmed).unwrap_or_default()
    }
}

/// A mutable resource with a controller-side write and a worker-side bounded
/// blocking read.
pub trait SharedBuffer: Send + Sync + fmt::Debug {
    /// URL the worker uses to reach this buffer.
    fn url(&self) -> &str;

    /// Replaces the content.
    fn write(&self, content: &BufferContent) -> Result<(), BufferError>;

    /// Returns the current content without waiting.
    fn read(&self) -> Result<BufferContent, BufferError>;

    /// Waits up to `wait` for content newer than `after` (see
    /// [`BufferContent::is_newer_than`]). Returns `None` if nothing newer
    /// appeared in time.
    ///
    /// The default implementation polls [`SharedBuffer::read`] every
    /// [`SharedBuffer::poll_interval`].
    fn read_newer(&self, after: Option<u64>, wait: Duration) -> Result<Option<BufferContent>, BufferError> {
        let deadline = Instant::now() + wait;
        loop {
            let content = self.read()?;
            if content.is_newer_than(after) {
                return Ok(Some(content));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_interval().min(deadline - now));
        }
    }

    /// How long a polling reader sleeps between reads.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
    }

    /// Resets to `Empty`.
    fn clear(&self) -> Result<(), BufferError> {
        self.write(&BufferContent::Empty)
    }

    /// Marks the buffer closed so blocked readers stop waiting.
    fn close(&self) -> Result<(), BufferError> {
        self.write(&BufferContent::Closed)
    }
}

// =============================================================================
// MemoryBuffer
// =============================================================================

/// In-process buffer. Readers sleep on a condition variable instead of
/// polling, so a worker thread is woken as soon as a line is written.
#[derive(Debug)]
pub struct MemoryBuffer {
    url: String,
    content: Mutex<BufferContent>,
    changed: Condvar,
}

impl MemoryBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            url: format!("memory://{}", Uuid::new_v4()),
            content: Mutex::new(BufferContent::Empty),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferContent> {
        // The guarded value is always a complete `BufferContent`, so a
        // poisoned lock still holds a usable value.
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedBuffer for MemoryBuffer {
    fn url(&self) -> &str {
        &self.url
    }

    fn write(&self, content: &BufferContent) -> Result<(), BufferError> {
        *self.lock() = content.clone();
        self.changed.notify_all();
        Ok(())
    }

    fn read(&self) -> Result<BufferContent, BufferError> {
        Ok(self.lock().clone())
    }

    fn read_newer(&self, after: Option<u64>, wait: Duration) -> Result<Option<BufferContent>, BufferError> {
        let deadline = Instant::now() + wait;
        let mut guard = self.lock();
        loop {
            if guard.is_newer_than(after) {
                return Ok(Some(guard.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            guard = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

// =============================================================================
// FileBuffer
// =============================================================================

/// File-backed buffer addressed by a `file://` URL.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a concurrent reader sees either the old or the new content, never a torn
/// write.
pub struct FileBuffer {
    path: PathBuf,
    url: String,
    poll_interval: Duration,
    /// Keeps a buffer created by [`FileBuffer::temporary`] alive.
    _dir: Option<TempDir>,
}

impl fmt::Debug for FileBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBuffer").field("path", &self.path).finish_non_exhaustive()
    }
}

impl FileBuffer {
    /// Opens (or creates, empty) a buffer at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, BufferError> {
        Self::open(path.into(), None)
    }

    fn open(path: PathBuf, dir: Option<TempDir>) -> Result<Self, BufferError> {
        let path = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        if !path.exists() {
            fs::write(&path, b"")?;
        }
        let url = Url::from_file_path(&path)
            .map_err(|()| BufferError::InvalidUrl {
                url: path.display().to_string(),
                reason: "path cannot be expressed as a file url".to_owned(),
            })?
            .to_string();
        Ok(Self {
            path,
            url,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            _dir: dir,
        })
    }

    /// Creates a buffer in a fresh temporary directory that is removed when
    /// the buffer is dropped.
    pub fn temporary() -> Result<Self, BufferError> {
        let dir = tempfile::Builder::new().prefix("replbridge-").tempdir()?;
        let path = dir.path().join("input.buf");
        Self::open(path, Some(dir))
    }

    /// Opens an existing buffer from its `file://` URL.
    pub fn from_url(url: &str) -> Result<Self, BufferError> {
        let parsed = Url::parse(url).map_err(|err| BufferError::InvalidUrl {
            url: url.to_owned(),
            reason: err.to_string(),
        })?;
        if parsed.scheme() != "file" {
            return Err(BufferError::InvalidUrl {
                url: url.to_owned(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        let path = parsed.to_file_path().map_err(|()| BufferError::InvalidUrl {
            url: url.to_owned(),
            reason: "url does not name a local file".to_owned(),
        })?;
        Self::create(path)
    }

    /// Sets how often a blocked read re-checks the file.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SharedBuffer for FileBuffer {
    fn url(&self) -> &str {
        &self.url
    }

    fn write(&self, content: &BufferContent) -> Result<(), BufferError> {
        let bytes = serde_json::to_vec(content)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(&bytes)?;
        staged.flush()?;
        staged.persist(&self.path).map_err(|err| BufferError::Io(err.error))?;
        Ok(())
    }

    fn read(&self) -> Result<BufferContent, BufferError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(BufferContent::decode(&raw)),
            // The file is replaced by rename; a reader racing the very first
            // write may not see it yet.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BufferContent::Empty),
            Err(err) => Err(err.into()),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
