//! Error types for every stage of the execution session bridge.
//!
//! Failures are split by where they happen so callers can pick a recovery
//! policy without string matching: boot failures leave the session
//! uninitialized, script errors leave it ready, transport failures force a
//! restart.

use std::{io, time::Duration};

use thiserror::Error;

/// Failure reading or writing the shared input buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The backing storage could not be read or written.
    #[error("shared buffer i/o failed: {0}")]
    Io(#[from] io::Error),
    /// The buffer URL could not be parsed or does not name a usable location.
    #[error("invalid shared buffer url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Serializing the buffer content failed.
    #[error("shared buffer encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of the message link between the controller and a worker.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The worker could not be created.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    /// The other side of the message link is gone.
    #[error("worker disconnected")]
    Disconnected,
    /// The worker was terminated while a request was still pending.
    #[error("worker terminated while a {pending} request was pending")]
    Terminated { pending: &'static str },
    /// Reading or writing the link failed.
    #[error("worker link i/o failed: {0}")]
    Io(#[from] io::Error),
    /// A frame could not be encoded or decoded.
    #[error("malformed worker message: {0}")]
    Codec(#[from] serde_json::Error),
    /// The shared buffer cannot be reached from the worker's context.
    #[error("shared buffer '{0}' is not reachable from an out-of-process worker")]
    UnreachableBuffer(String),
}

/// Failure of an interpreter I/O callback on the worker side.
#[derive(Debug, Error)]
pub enum HostIoError {
    /// The controller is no longer listening.
    #[error("controller disconnected")]
    Disconnected,
    /// The worker has been terminated.
    #[error("worker terminated")]
    Terminated,
    /// The controller closed the shared buffer during teardown.
    #[error("input channel closed")]
    BufferClosed,
    /// Nobody answered the input request in time.
    #[error("no input received within {0:?}")]
    InputTimeout(Duration),
    /// The shared buffer could not be read.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// An error raised by the interpreter while booting or running a statement.
///
/// Rendered as `Kind: message`, the way an interactive shell prints an
/// uncaught exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    /// Exception class name, e.g. `NameError`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl ScriptError {
    /// Creates a new script error.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<HostIoError> for ScriptError {
    fn from(error: HostIoError) -> Self {
        let kind = match error {
            HostIoError::InputTimeout(_) => "TimeoutError",
            HostIoError::BufferClosed => "EOFError",
            HostIoError::Disconnected | HostIoError::Terminated => "SystemExit",
            HostIoError::Buffer(_) => "OSError",
        };
        Self::new(kind, error.to_string())
    }
}

/// The interpreter failed to load or initialize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("interpreter failed to boot: {0}")]
pub struct BootError(pub String);

/// Controller-level failure.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The worker reported a boot failure; the session stays uninitialized.
    #[error(transparent)]
    Boot(#[from] BootError),
    /// The worker link failed; the session was forced back to uninitialized.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The shared buffer could not be reset or written.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// A `run` was issued while a previous one is still pending.
    #[error("a statement is already running")]
    RunInFlight,
    /// The worker did not acknowledge `init` in time.
    #[error("worker did not finish initializing within {0:?}")]
    InitTimeout(Duration),
    /// A runtime input line was supplied but no input request is pending.
    #[error("no runtime input request is pending")]
    NotAwaitingInput,
    /// The host's source could not be read.
    #[error("failed to read source '{name}': {source}")]
    Source {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// The configuration file could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The file is not valid configuration JSON.
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
