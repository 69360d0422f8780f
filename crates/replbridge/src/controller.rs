//! Host-side session state machine.
//!
//! The controller owns at most one worker link. It routes worker events into
//! the [`Transcript`], tracks the single pending `init` and `run` request, and
//! answers runtime input requests by writing sequenced lines into the shared
//! buffer.
//!
//! ```text
//! UNINITIALIZED --start--> INITIALIZING --init ok--> READY
//!       ^                        |                     |
//!       +------ init failed -----+                     |
//!       +------ teardown / worker lost ----------------+
//! ```

use std::{
    sync::{Arc, mpsc::RecvTimeoutError, mpsc::TryRecvError},
    time::{Duration, Instant},
};

use crate::{
    config::SessionConfig,
    error::{BootError, SessionError, TransportError},
    history::HistoryStore,
    protocol::{WorkerCommand, WorkerEvent},
    shared_buffer::{BufferContent, SharedBuffer},
    source::SourceProvider,
    statement::{LineOutcome, StatementBuffer},
    transcript::{EntryKind, Transcript},
    transport::{WorkerLink, WorkerSpawner},
};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No live worker, or the last boot failed.
    Uninitialized,
    /// A worker was spawned and `init` is pending.
    Initializing,
    /// The interpreter is booted; runs may be submitted.
    Ready,
}

/// Why [`SessionController::wait`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Nothing is pending any more.
    Idle,
    /// The running statement is blocked on a line of input.
    AwaitingInput { prompt: Option<String> },
    /// The wait bound elapsed with a request still pending.
    TimedOut,
}

/// How the most recent `run` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The statement finished; `output` is the repr of its value, if any.
    Completed { output: Option<String> },
    /// The statement raised, the worker failed, or the run was abandoned.
    Failed { error: String },
}

/// Drives one worker on behalf of a host UI.
///
/// Worker output, results and script errors are rendered into the
/// transcript as they arrive. Failures returned as [`SessionError`] are left
/// to the caller, which can render them with [`report`](Self::report).
pub struct SessionController<T: Transcript> {
    config: SessionConfig,
    spawner: Box<dyn WorkerSpawner>,
    buffer: Arc<dyn SharedBuffer>,
    transcript: T,
    link: Option<WorkerLink>,
    state: SessionState,
    pending_init: bool,
    pending_run: bool,
    boot_error: Option<BootError>,
    last_run: Option<RunOutcome>,
    input_prompt: Option<String>,
    /// Id of the open input request; answers are stamped with it.
    input_request: Option<u64>,
    /// Set by an `input` event until `wait` has reported it.
    announce_input: bool,
    /// Sequence number of the next runtime input line; never reset.
    input_sequence: u64,
    statements: StatementBuffer,
    history: HistoryStore,
}

impl<T: Transcript> SessionController<T> {
    /// Creates an uninitialized session. No worker is spawned until
    /// [`start`](Self::start) or the first submission.
    pub fn new(
        config: SessionConfig,
        spawner: Box<dyn WorkerSpawner>,
        buffer: Arc<dyn SharedBuffer>,
        transcript: T,
    ) -> Self {
        Self {
            config,
            spawner,
            buffer,
            transcript,
            link: None,
            state: SessionState::Uninitialized,
            pending_init: false,
            pending_run: false,
            boot_error: None,
            last_run: None,
            input_prompt: None,
            input_request: None,
            announce_input: false,
            input_sequence: 0,
            statements: StatementBuffer::new(),
            history: HistoryStore::new(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns a fresh worker and boots its interpreter, blocking until the
    /// `init` reply arrives or the configured init timeout elapses.
    ///
    /// Any existing worker is terminated first, so at most one worker is ever
    /// live. The shared buffer is reset before the new worker can read it.
    ///
    /// # Errors
    /// [`SessionError::Boot`] when the interpreter reports a boot failure,
    /// [`SessionError::InitTimeout`] when no reply arrives in time, and
    /// [`SessionError::Transport`] when the worker cannot be spawned or dies.
    /// The session is `UNINITIALIZED` after any error.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if let Some(err) = self.drop_worker(|pending| TransportError::Terminated { pending }) {
            tracing::debug!(%err, "restart abandoned a pending request");
            self.transcript.print(&err.to_string(), EntryKind::Error);
        }
        self.boot_error = None;
        self.buffer.clear()?;

        let mut link = self.spawner.spawn(&self.buffer)?;
        link.handle
            .post(WorkerCommand::init(&self.config, self.buffer.url()))?;
        self.link = Some(link);
        self.state = SessionState::Initializing;
        self.pending_init = true;
        tracing::info!(buffer = self.buffer.url(), "initializing worker");

        self.await_init()
    }

    /// Same as [`start`](Self::start); the old worker is always discarded.
    pub fn restart(&mut self) -> Result<(), SessionError> {
        self.start()
    }

    /// Terminates the worker and closes the shared buffer so a blocked input
    /// read ends. Returns the rejection of the request that was pending, if
    /// any. Safe to call in any state.
    pub fn teardown(&mut self) -> Option<TransportError> {
        let rejected = self.drop_worker(|pending| TransportError::Terminated { pending });
        if let Err(err) = self.buffer.close() {
            tracing::warn!(%err, "failed to close shared buffer");
        }
        tracing::info!("session torn down");
        rejected
    }

    /// Runs the host's whole buffer in a fresh interpreter: clears the
    /// transcript and statement buffer, restarts the worker, then submits the
    /// text. Output arrives through [`wait`](Self::wait).
    pub fn run_source(&mut self, source: &dyn SourceProvider) -> Result<(), SessionError> {
        let code = source.current_text().map_err(|err| SessionError::Source {
            name: source.name().to_owned(),
            source: err,
        })?;
        self.transcript.clear();
        self.statements.clear();
        self.transcript.print("initializing", EntryKind::Info);
        self.start()?;
        self.submit(&code)
    }

    fn await_init(&mut self) -> Result<(), SessionError> {
        let limit = self.config.init_timeout();
        let deadline = limit.map(|limit| Instant::now() + limit);
        while self.pending_init {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => Some(remaining),
                    None => {
                        self.drop_worker(|pending| TransportError::Terminated { pending });
                        return Err(SessionError::InitTimeout(limit.unwrap_or_default()));
                    }
                },
                None => None,
            };
            if let Some(event) = self.next_event(remaining)? {
                self.dispatch(event);
            }
        }

        if self.state == SessionState::Ready {
            Ok(())
        } else {
            let err = self
                .boot_error
                .clone()
                .unwrap_or_else(|| BootError("worker did not report a reason".to_owned()));
            Err(err.into())
        }
    }

    // =========================================================================
    // Running statements
    // =========================================================================

    /// Sends `code` to the worker, starting the session first if needed.
    ///
    /// # Errors
    /// [`SessionError::RunInFlight`] when a run is still pending, plus any
    /// error from [`start`](Self::start).
    pub fn submit(&mut self, code: &str) -> Result<(), SessionError> {
        if self.pending_run {
            return Err(SessionError::RunInFlight);
        }
        if self.state != SessionState::Ready {
            self.start()?;
        }

        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::Disconnected.into());
        };
        if let Err(err) = link.handle.post(WorkerCommand::Run { code: code.to_owned() }) {
            tracing::warn!(%err, "failed to post run");
            self.drop_worker(|_| TransportError::Disconnected);
            return Err(err.into());
        }
        self.pending_run = true;
        self.last_run = None;
        tracing::debug!(bytes = code.len(), "submitted run");
        Ok(())
    }

    /// Feeds one line typed by the user.
    ///
    /// A line that completes a statement is recorded in history, echoed and
    /// submitted. While the worker is waiting for runtime input the line is
    /// delivered to it instead and never reaches history.
    ///
    /// # Errors
    /// [`SessionError::RunInFlight`] when a statement is still running and no
    /// input is requested, and [`SessionError::NotAwaitingInput`] when the
    /// input request the line was meant for has ended in the meantime. The
    /// line is not consumed in either case.
    pub fn handle_line(&mut self, line: &str) -> Result<LineOutcome, SessionError> {
        if self.statements.is_awaiting_runtime_input() {
            self.ensure_input_open()?;
        } else if self.pending_run {
            return Err(SessionError::RunInFlight);
        }

        let outcome = self.statements.push_line(line);
        match &outcome {
            LineOutcome::Statement(source) => {
                let echoed = source.trim_end();
                self.history.push(source.trim());
                self.transcript.print(echoed, EntryKind::Input);
                self.submit(source)?;
            }
            LineOutcome::RuntimeInput(text) => self.write_input(text)?,
            LineOutcome::Ignored | LineOutcome::Incomplete => {}
        }
        Ok(outcome)
    }

    /// Answers the pending runtime input request with `text`.
    ///
    /// # Errors
    /// [`SessionError::NotAwaitingInput`] when no request is pending, or the
    /// one the caller saw has ended (for example by timing out).
    pub fn deliver_input(&mut self, text: &str) -> Result<(), SessionError> {
        if !self.statements.is_awaiting_runtime_input() {
            return Err(SessionError::NotAwaitingInput);
        }
        self.ensure_input_open()?;
        self.statements.set_awaiting_runtime_input(false);
        self.write_input(text)
    }

    /// Handles events that already arrived, then checks that the input
    /// request the caller is answering is still the open one.
    fn ensure_input_open(&mut self) -> Result<(), SessionError> {
        let answering = self.input_request;
        self.poll()?;
        if answering.is_some() && self.input_request == answering {
            Ok(())
        } else {
            tracing::debug!(?answering, open = ?self.input_request, "input request ended before the answer");
            Err(SessionError::NotAwaitingInput)
        }
    }

    fn write_input(&mut self, text: &str) -> Result<(), SessionError> {
        let Some(request) = self.input_request else {
            return Err(SessionError::NotAwaitingInput);
        };
        let sequence = self.input_sequence;
        self.buffer.write(&BufferContent::Line {
            request,
            sequence,
            text: text.to_owned(),
        })?;
        self.input_sequence += 1;
        self.input_request = None;
        self.input_prompt = None;
        self.transcript.print(text, EntryKind::Input);
        tracing::debug!(request, sequence, "delivered runtime input");
        Ok(())
    }

    // =========================================================================
    // Event pump
    // =========================================================================

    /// Handles every event that has already arrived, without blocking.
    pub fn poll(&mut self) -> Result<(), SessionError> {
        while self.link.is_some() {
            match self.next_event(Some(Duration::ZERO))? {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
        Ok(())
    }

    /// Handles events until nothing is pending, the worker asks for input,
    /// or `timeout` elapses (`None` waits without bound).
    ///
    /// Each input request is reported once. Waiting again without answering
    /// it keeps pumping events, so an input timeout on the worker side still
    /// surfaces as a failed run.
    ///
    /// # Errors
    /// [`SessionError::Transport`] when the worker exits while a request is
    /// pending; the session is then `UNINITIALIZED`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<WaitOutcome, SessionError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.announce_input && self.statements.is_awaiting_runtime_input() {
                self.announce_input = false;
                return Ok(WaitOutcome::AwaitingInput {
                    prompt: self.input_prompt.clone(),
                });
            }
            if !self.pending_run && !self.pending_init {
                return Ok(WaitOutcome::Idle);
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => Some(remaining),
                    None => return Ok(WaitOutcome::TimedOut),
                },
                None => None,
            };
            if let Some(event) = self.next_event(remaining)? {
                self.dispatch(event);
            }
        }
    }

    /// Receives one event. `Ok(None)` means the bound elapsed.
    fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<WorkerEvent>, SessionError> {
        let Some(link) = self.link.as_ref() else {
            return Err(TransportError::Disconnected.into());
        };
        let received = match timeout {
            Some(Duration::ZERO) => match link.events.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(()),
            },
            Some(timeout) => match link.events.recv_timeout(timeout) {
                Ok(event) => Ok(Some(event)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(()),
            },
            None => link.events.recv().map(Some).map_err(|_| ()),
        };
        received.map_err(|()| {
            tracing::warn!(state = %self.state, "worker exited unexpectedly");
            self.drop_worker(|_| TransportError::Disconnected);
            TransportError::Disconnected.into()
        })
    }

    fn dispatch(&mut self, event: WorkerEvent) {
        tracing::debug!(action = event.action(), "worker event");
        match event {
            WorkerEvent::Init { success, error } => {
                if !self.pending_init {
                    tracing::warn!("init reply with no pending init");
                    return;
                }
                self.pending_init = false;
                if success {
                    self.state = SessionState::Ready;
                    tracing::info!("worker ready");
                } else {
                    let err = BootError(error.unwrap_or_else(|| "unknown error".to_owned()));
                    tracing::warn!(%err, "worker failed to boot");
                    self.boot_error = Some(err);
                    self.drop_worker(|pending| TransportError::Terminated { pending });
                }
            }
            WorkerEvent::Run { success, output, error } => {
                if !self.pending_run {
                    tracing::warn!("run reply with no pending run");
                    return;
                }
                self.pending_run = false;
                self.statements.set_awaiting_runtime_input(false);
                self.input_request = None;
                self.input_prompt = None;
                if success {
                    if let Some(output) = output.as_deref().filter(|output| !output.is_empty()) {
                        self.transcript.print(output, EntryKind::Output);
                    }
                    self.last_run = Some(RunOutcome::Completed { output });
                } else {
                    let error = error.unwrap_or_else(|| "unknown error".to_owned());
                    self.transcript.print(&error, EntryKind::Error);
                    self.last_run = Some(RunOutcome::Failed { error });
                }
            }
            WorkerEvent::Stdout { text } => self.transcript.print(&text, EntryKind::Output),
            WorkerEvent::Stderr { text } => self.transcript.print(&text, EntryKind::Error),
            WorkerEvent::Input { request, text } => {
                // Stale lines must not answer this request.
                if let Err(err) = self.buffer.clear() {
                    tracing::warn!(%err, "failed to reset shared buffer");
                }
                self.statements.set_awaiting_runtime_input(true);
                self.input_request = Some(request);
                self.announce_input = true;
                if let Some(prompt) = text.as_deref().filter(|prompt| !prompt.is_empty()) {
                    self.transcript.print(prompt, EntryKind::Output);
                }
                self.input_prompt = text;
            }
        }
    }

    /// Terminates the live worker, if any, and rejects whatever request was
    /// pending with `reason`. Leaves the session `UNINITIALIZED`.
    fn drop_worker(&mut self, reason: impl Fn(&'static str) -> TransportError) -> Option<TransportError> {
        if let Some(mut link) = self.link.take() {
            link.handle.terminate();
        }
        self.state = SessionState::Uninitialized;
        self.statements.set_awaiting_runtime_input(false);
        self.input_request = None;
        self.input_prompt = None;

        let pending = if self.pending_run {
            "run"
        } else if self.pending_init {
            "init"
        } else {
            return None;
        };
        let was_run = self.pending_run;
        self.pending_run = false;
        self.pending_init = false;

        let err = reason(pending);
        if was_run {
            self.last_run = Some(RunOutcome::Failed { error: err.to_string() });
        }
        Some(err)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn is_run_pending(&self) -> bool {
        self.pending_run
    }

    #[must_use]
    pub fn is_awaiting_input(&self) -> bool {
        self.statements.is_awaiting_runtime_input()
    }

    /// Outcome of the most recent run, once its reply has arrived.
    #[must_use]
    pub fn last_run(&self) -> Option<&RunOutcome> {
        self.last_run.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn statements(&self) -> &StatementBuffer {
        &self.statements
    }

    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryStore {
        &mut self.history
    }

    #[must_use]
    pub fn transcript(&self) -> &T {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut T {
        &mut self.transcript
    }

    /// Clears the console view. Session state is untouched.
    pub fn clear_console(&mut self) {
        self.transcript.clear();
    }

    /// Writes a failure the host received into the transcript.
    pub fn report(&mut self, err: &SessionError) {
        self.transcript.print(&err.to_string(), EntryKind::Error);
    }
}

impl<T: Transcript> Drop for SessionController<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
