#![doc = include_str!("../../../README.md")]

mod config;
mod controller;
mod error;
mod history;
mod input_bridge;
pub mod interpreter;
pub mod protocol;
mod shared_buffer;
mod source;
mod statement;
mod transcript;
pub mod transport;
mod worker;

pub use crate::{
    config::{DEFAULT_INIT_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS, SessionConfig},
    controller::{RunOutcome, SessionController, SessionState, WaitOutcome},
    error::{BootError, BufferError, ConfigError, HostIoError, ScriptError, SessionError, TransportError},
    history::{CursorLine, HistoryStore, Recall},
    input_bridge::InputBridge,
    interpreter::{BootConfig, Interpreter, InterpreterFactory, MiniFactory, MiniInterpreter, ScriptIo},
    protocol::{WorkerCommand, WorkerEvent},
    shared_buffer::{BufferContent, FileBuffer, MemoryBuffer, SharedBuffer},
    source::{FileSource, SourceProvider, TextSource},
    statement::{LineOutcome, StatementBuffer, is_incomplete},
    transcript::{CollectTranscript, Entry, EntryKind, StdTranscript, Transcript},
    transport::{ProcessSpawner, ThreadSpawner, WorkerHandle, WorkerLink, WorkerSpawner, serve, serve_stdio},
    worker::{BufferSource, ChannelSink, EventSink, ExecutionWorker, FrameSink},
};
