//! Isolated execution contexts for workers and the message links to them.
//!
//! | Spawner | Context | Commands / events | Termination |
//! |---------|---------|-------------------|-------------|
//! | [`ThreadSpawner`] | dedicated thread | `std::sync::mpsc` | cancellation flag, thread detached |
//! | [`ProcessSpawner`] | child process | JSON lines on stdin / stdout | child killed |
//!
//! Terminating a worker is the only cancellation primitive. The controller
//! notices an unexpected exit when the event receiver disconnects.

use std::{
    ffi::OsString,
    io::{self, BufRead, BufReader, Write},
    path::PathBuf,
    process::{Child, ChildStdin, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

use crate::{
    error::TransportError,
    interpreter::InterpreterFactory,
    protocol::{WorkerCommand, WorkerEvent, decode_frame, encode_frame},
    shared_buffer::SharedBuffer,
    worker::{BufferSource, ChannelSink, ExecutionWorker, FrameSink},
};

/// Controller-side handle to a live worker.
pub trait WorkerHandle: Send {
    /// Posts one command. Fails if the worker is gone.
    fn post(&mut self, command: WorkerCommand) -> Result<(), TransportError>;

    /// Stops the worker unconditionally, aborting any in-flight `run` or
    /// blocked input read. Calling it more than once is harmless.
    fn terminate(&mut self);
}

/// A freshly spawned worker: its command handle and its ordered event stream.
pub struct WorkerLink {
    pub handle: Box<dyn WorkerHandle>,
    pub events: Receiver<WorkerEvent>,
}

/// Creates workers.
pub trait WorkerSpawner: Send {
    /// Starts a worker that will reach `buffer` for runtime input.
    fn spawn(&mut self, buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError>;
}

// =============================================================================
// Thread transport
// =============================================================================

/// Runs each worker on its own named thread.
pub struct ThreadSpawner {
    factory: Arc<dyn InterpreterFactory>,
    spawned: usize,
}

impl ThreadSpawner {
    #[must_use]
    pub fn new(factory: Arc<dyn InterpreterFactory>) -> Self {
        Self { factory, spawned: 0 }
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&mut self, buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>();
        let cancelled = Arc::new(AtomicBool::new(false));

        let sink = ChannelSink::new(event_tx, Arc::clone(&cancelled));
        let factory = Arc::clone(&self.factory);
        let buffer = Arc::clone(buffer);

        self.spawned += 1;
        let name = format!("replbridge-worker-{}", self.spawned);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Built on the worker thread: interpreters never cross threads.
                let mut worker = ExecutionWorker::new(factory, BufferSource::Attached(buffer));
                worker.run_loop(command_rx, &sink);
            })
            .map_err(|err| TransportError::Spawn(err.to_string()))?;
        tracing::info!(worker = %name, "spawned worker thread");

        Ok(WorkerLink {
            handle: Box::new(ThreadHandle {
                commands: Some(command_tx),
                cancelled,
            }),
            events: event_rx,
        })
    }
}

struct ThreadHandle {
    commands: Option<Sender<WorkerCommand>>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerHandle for ThreadHandle {
    fn post(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        let Some(commands) = &self.commands else {
            return Err(TransportError::Disconnected);
        };
        commands.send(command).map_err(|_| TransportError::Disconnected)
    }

    fn terminate(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        // Dropping the sender ends the worker's command loop; a worker blocked
        // on input sees the flag on its next bounded read.
        self.commands = None;
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

// =============================================================================
// Process transport
// =============================================================================

/// Runs each worker as a child process speaking JSON lines on stdio.
///
/// The child is expected to call [`serve_stdio`]; the CLI does so when
/// started with `--worker`. Only a `file://` shared buffer is reachable from
/// the child.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Adds one argument to the child's command line.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self, buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError> {
        if !buffer.url().starts_with("file://") {
            return Err(TransportError::UnreachableBuffer(buffer.url().to_owned()));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| TransportError::Spawn(format!("{}: {err}", self.program.display())))?;
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(TransportError::Spawn("child stdout was not captured".to_owned()));
        };

        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>();
        let pid = child.id();
        let reader = thread::Builder::new()
            .name(format!("replbridge-worker-{pid}-reader"))
            .spawn(move || forward_events(BufReader::new(stdout), &event_tx));
        if let Err(err) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Spawn(err.to_string()));
        }
        tracing::info!(pid, "spawned worker process");

        Ok(WorkerLink {
            handle: Box::new(ProcessHandle {
                child: Some(child),
                stdin,
            }),
            events: event_rx,
        })
    }
}

/// Decodes event frames from the child until it exits or the controller
/// drops the receiver.
fn forward_events(reader: impl BufRead, events: &Sender<WorkerEvent>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(%err, "worker stdout closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_frame::<WorkerEvent>(&line) {
            Ok(event) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(err) => tracing::warn!(%err, frame = %line, "dropping malformed worker frame"),
        }
    }
}

struct ProcessHandle {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl WorkerHandle for ProcessHandle {
    fn post(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        let frame = encode_frame(&command)?;
        stdin.write_all(frame.as_bytes()).map_err(disconnected_on_pipe)?;
        stdin.flush().map_err(disconnected_on_pipe)?;
        Ok(())
    }

    fn terminate(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                // `InvalidInput` means the child already exited.
                if err.kind() != io::ErrorKind::InvalidInput {
                    tracing::warn!(%err, pid = child.id(), "failed to kill worker process");
                }
            }
            let _ = child.wait();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn disconnected_on_pipe(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::BrokenPipe {
        TransportError::Disconnected
    } else {
        TransportError::Io(err)
    }
}

// =============================================================================
// Worker-side stdio loop
// =============================================================================

/// Serves the worker protocol on this process's stdin and stdout.
///
/// Returns when stdin closes. Stdout carries protocol frames only.
pub fn serve_stdio(factory: Arc<dyn InterpreterFactory>) -> Result<(), TransportError> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(stdin.lock(), stdout.lock(), factory)
}

/// Serves the worker protocol over an arbitrary reader / writer pair.
pub fn serve(
    reader: impl BufRead,
    writer: impl Write,
    factory: Arc<dyn InterpreterFactory>,
) -> Result<(), TransportError> {
    let sink = FrameSink::new(writer);
    let mut worker = ExecutionWorker::new(factory, BufferSource::FromUrl);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_frame::<WorkerCommand>(&line) {
            Ok(command) => worker.handle(command, &sink)?,
            Err(err) => tracing::warn!(%err, frame = %line, "ignoring malformed command"),
        }
    }
    Ok(())
}
