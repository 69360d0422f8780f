//! Wire messages exchanged between the controller and an execution worker.
//!
//! Both directions are fire-and-forget and ordered per direction. There is no
//! request id: at most one `init` and one `run` are outstanding at a time, so
//! a reply is paired with "the" pending request of its action.
//!
//! Every message is a JSON object tagged by `action`:
//!
//! | action | direction | payload |
//! |--------|-----------|---------|
//! | `init` | C→W | `{baseUrl, sharedBufferUrl, packages, inputTimeoutMs, pollIntervalMs}` |
//! | `init` | W→C | `{success, error?}` |
//! | `run` | C→W | `{code}` |
//! | `run` | W→C | `{success, output?, error?}` |
//! | `stdout` | W→C | `{text}` |
//! | `stderr` | W→C | `{text}` |
//! | `input` | W→C | `{request, text?}` |

use serde::{Deserialize, Serialize};

use crate::{config::SessionConfig, error::TransportError};

/// Controller → worker command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    /// Boot the interpreter.
    Init {
        base_url: String,
        shared_buffer_url: String,
        #[serde(default)]
        packages: Vec<String>,
        #[serde(default)]
        input_timeout_ms: Option<u64>,
        #[serde(default)]
        poll_interval_ms: Option<u64>,
    },
    /// Execute source text.
    Run { code: String },
}

impl WorkerCommand {
    /// Builds the `init` command for a session config and buffer URL.
    #[must_use]
    pub fn init(config: &SessionConfig, shared_buffer_url: &str) -> Self {
        Self::Init {
            base_url: config.base_url.clone(),
            shared_buffer_url: shared_buffer_url.to_owned(),
            packages: config.packages.clone(),
            input_timeout_ms: config.input_timeout_ms,
            poll_interval_ms: Some(config.poll_interval_ms),
        }
    }

    /// The `action` tag of this command.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Run { .. } => "run",
        }
    }
}

/// Worker → controller event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Boot result.
    Init {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Execution result.
    Run {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One incremental standard output write.
    Stdout { text: String },
    /// One incremental standard error write.
    Stderr { text: String },
    /// The interpreter is blocked waiting for a line of input.
    Input {
        /// Identifies this request; only a line stamped with it answers it.
        request: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl WorkerEvent {
    #[must_use]
    pub fn init_ok() -> Self {
        Self::Init {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn init_failed(error: impl Into<String>) -> Self {
        Self::Init {
            success: false,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn run_ok(output: Option<String>) -> Self {
        Self::Run {
            success: true,
            output,
            error: None,
        }
    }

    #[must_use]
    pub fn run_failed(error: impl Into<String>) -> Self {
        Self::Run {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// The `action` tag of this event.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Run { .. } => "run",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Input { .. } => "input",
        }
    }
}

/// Encodes a message as one newline-terminated JSON frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, TransportError> {
    let mut frame = serde_json::to_string(message)?;
    frame.push('\n');
    Ok(frame)
}

/// Decodes one JSON frame. Surrounding whitespace, including the line
/// terminator, is ignored.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(frame: &str) -> Result<T, TransportError> {
    Ok(serde_json::from_str(frame.trim())?)
}
