//! The execution worker: hosts one interpreter per (re)initialization and
//! turns its I/O into protocol messages.
//!
//! The worker is transport-agnostic. It consumes [`WorkerCommand`]s and posts
//! [`WorkerEvent`]s through an [`EventSink`]; the transports in
//! [`crate::transport`] decide whether that happens on a thread or in a child
//! process. Every failure, including an interpreter panic, ends in a tagged
//! `success: false` event rather than escaping the message boundary.

use std::{
    any::Any,
    cell::RefCell,
    io::Write,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    time::Duration,
};

use crate::{
    config::DEFAULT_POLL_INTERVAL_MS,
    error::{BootError, HostIoError, TransportError},
    input_bridge::InputBridge,
    interpreter::{BootConfig, Interpreter, InterpreterFactory, ScriptIo},
    protocol::{WorkerCommand, WorkerEvent, encode_frame},
    shared_buffer::{FileBuffer, SharedBuffer},
};

/// Destination for events posted by a worker.
pub trait EventSink {
    /// Posts one event. Fails once the controller side is gone.
    fn post(&self, event: WorkerEvent) -> Result<(), TransportError>;

    /// Returns true once the worker has been told to stop.
    fn is_terminated(&self) -> bool {
        false
    }
}

/// Sink for an in-process worker: an mpsc sender plus the cancellation flag
/// its controller-side handle sets on termination.
#[derive(Debug)]
pub struct ChannelSink {
    events: Sender<WorkerEvent>,
    cancelled: Arc<AtomicBool>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(events: Sender<WorkerEvent>, cancelled: Arc<AtomicBool>) -> Self {
        Self { events, cancelled }
    }
}

impl EventSink for ChannelSink {
    fn post(&self, event: WorkerEvent) -> Result<(), TransportError> {
        if self.is_terminated() {
            return Err(TransportError::Disconnected);
        }
        self.events.send(event).map_err(|_| TransportError::Disconnected)
    }

    fn is_terminated(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Sink that writes one JSON frame per event, used by an out-of-process
/// worker on its stdout.
#[derive(Debug)]
pub struct FrameSink<W: Write> {
    writer: RefCell<W>,
}

impl<W: Write> FrameSink<W> {
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: RefCell::new(writer),
        }
    }
}

impl<W: Write> EventSink for FrameSink<W> {
    fn post(&self, event: WorkerEvent) -> Result<(), TransportError> {
        let frame = encode_frame(&event)?;
        let mut writer = self.writer.borrow_mut();
        writer.write_all(frame.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// Where a worker finds the shared buffer named in `init`.
#[derive(Debug, Clone)]
pub enum BufferSource {
    /// The buffer object is handed over directly (same process).
    Attached(Arc<dyn SharedBuffer>),
    /// The buffer is opened from the `sharedBufferUrl` in `init`.
    FromUrl,
}

/// A booted interpreter and the input bridge wired to it.
struct Booted {
    interpreter: Box<dyn Interpreter>,
    bridge: InputBridge,
}

/// Processes `init` and `run` commands for one isolated context.
pub struct ExecutionWorker {
    factory: Arc<dyn InterpreterFactory>,
    buffer_source: BufferSource,
    booted: Option<Booted>,
}

impl ExecutionWorker {
    #[must_use]
    pub fn new(factory: Arc<dyn InterpreterFactory>, buffer_source: BufferSource) -> Self {
        Self {
            factory,
            buffer_source,
            booted: None,
        }
    }

    /// Returns true if an interpreter is live.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.booted.is_some()
    }

    /// Handles commands until the source is exhausted or the controller goes
    /// away.
    pub fn run_loop(&mut self, commands: impl IntoIterator<Item = WorkerCommand>, sink: &dyn EventSink) {
        for command in commands {
            if sink.is_terminated() {
                break;
            }
            if let Err(err) = self.handle(command, sink) {
                tracing::debug!(%err, "worker stopping: controller unreachable");
                break;
            }
        }
        tracing::debug!("worker loop finished");
    }

    /// Handles one command. Only a failure to post the reply is returned;
    /// boot and run failures are reported to the controller as events.
    pub fn handle(&mut self, command: WorkerCommand, sink: &dyn EventSink) -> Result<(), TransportError> {
        tracing::debug!(action = command.action(), "worker received command");
        match command {
            WorkerCommand::Init {
                base_url,
                shared_buffer_url,
                packages,
                input_timeout_ms,
                poll_interval_ms,
            } => {
                // A re-init replaces the live interpreter rather than adding one.
                self.booted = None;
                let config = BootConfig { base_url, packages };
                let event = match self.boot(
                    &config,
                    &shared_buffer_url,
                    input_timeout_ms.map(Duration::from_millis),
                    Duration::from_millis(poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
                ) {
                    Ok(()) => WorkerEvent::init_ok(),
                    Err(err) => {
                        tracing::warn!(%err, "interpreter boot failed");
                        WorkerEvent::init_failed(err.0)
                    }
                };
                sink.post(event)
            }
            WorkerCommand::Run { code } => {
                let event = self.run(&code, sink);
                sink.post(event)
            }
        }
    }

    fn boot(
        &mut self,
        config: &BootConfig,
        shared_buffer_url: &str,
        input_timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<(), BootError> {
        let buffer: Arc<dyn SharedBuffer> = match &self.buffer_source {
            BufferSource::Attached(buffer) => Arc::clone(buffer),
            BufferSource::FromUrl => Arc::new(
                FileBuffer::from_url(shared_buffer_url)
                    .map_err(|err| BootError(err.to_string()))?
                    .with_poll_interval(poll_interval),
            ),
        };
        let factory = Arc::clone(&self.factory);
        let interpreter = panic::catch_unwind(AssertUnwindSafe(|| factory.boot(config)))
            .map_err(|payload| BootError(format!("interpreter panicked: {}", panic_message(&*payload))))??;
        self.booted = Some(Booted {
            interpreter,
            bridge: InputBridge::new(buffer, input_timeout, poll_interval),
        });
        Ok(())
    }

    /// Resolves dependencies, executes `code` and builds the reply event.
    fn run(&mut self, code: &str, sink: &dyn EventSink) -> WorkerEvent {
        let Some(booted) = self.booted.as_mut() else {
            return WorkerEvent::run_failed("interpreter is not initialized");
        };
        let Booted { interpreter, bridge } = booted;
        let mut io = WorkerIo { sink, bridge };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            interpreter.load_packages_from_imports(code, &mut io)?;
            interpreter.run(code, &mut io)
        }));
        match outcome {
            Ok(Ok(output)) => WorkerEvent::run_ok(output),
            Ok(Err(err)) => WorkerEvent::run_failed(err.to_string()),
            Err(payload) => {
                // The interpreter's state is unknown after a panic; it must be
                // re-initialized before it runs anything else.
                self.booted = None;
                WorkerEvent::run_failed(format!("interpreter panicked: {}", panic_message(&*payload)))
            }
        }
    }
}

/// [`ScriptIo`] implementation handed to the interpreter during `run`.
struct WorkerIo<'a> {
    sink: &'a dyn EventSink,
    bridge: &'a mut InputBridge,
}

impl WorkerIo<'_> {
    fn post(&self, event: WorkerEvent) -> Result<(), HostIoError> {
        self.sink.post(event).map_err(|_| {
            if self.sink.is_terminated() {
                HostIoError::Terminated
            } else {
                HostIoError::Disconnected
            }
        })
    }
}

impl ScriptIo for WorkerIo<'_> {
    fn stdout(&mut self, text: &str) -> Result<(), HostIoError> {
        self.post(WorkerEvent::Stdout { text: text.to_owned() })
    }

    fn stderr(&mut self, text: &str) -> Result<(), HostIoError> {
        self.post(WorkerEvent::Stderr { text: text.to_owned() })
    }

    fn stdin(&mut self, prompt: Option<&str>) -> Result<String, HostIoError> {
        self.bridge.request_line(prompt, self.sink)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
