use std::{
    io::Write as _,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;
use replbridge::{
    BootConfig, BootError, BufferContent, CollectTranscript, CursorLine, EntryKind, FileSource, Interpreter,
    InterpreterFactory, LineOutcome, MemoryBuffer, MiniFactory, Recall, RunOutcome, ScriptError, ScriptIo,
    SessionConfig, SessionController, SessionError, SessionState, SharedBuffer, TextSource, ThreadSpawner,
    TransportError, WaitOutcome, WorkerCommand, WorkerEvent, WorkerHandle, WorkerLink, WorkerSpawner,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

type Session = SessionController<CollectTranscript>;

fn session_with(config: SessionConfig, spawner: impl WorkerSpawner + 'static) -> Session {
    SessionController::new(
        config,
        Box::new(spawner),
        Arc::new(MemoryBuffer::new()),
        CollectTranscript::new(),
    )
}

/// A session whose shared buffer the test can inspect.
fn session_sharing(
    buffer: &Arc<MemoryBuffer>,
    config: SessionConfig,
    spawner: impl WorkerSpawner + 'static,
) -> Session {
    SessionController::new(
        config,
        Box::new(spawner),
        Arc::clone(buffer) as Arc<dyn SharedBuffer>,
        CollectTranscript::new(),
    )
}

fn session() -> Session {
    session_with(SessionConfig::new(), ThreadSpawner::new(Arc::new(MiniFactory::new())))
}

/// Feeds lines one by one, pumping events after each, the way a terminal host does.
fn type_lines(session: &mut Session, lines: &[&str]) {
    for line in lines {
        session.handle_line(line).unwrap();
        session.wait(WAIT).unwrap();
    }
}

fn outputs(session: &Session) -> Vec<&str> {
    session.transcript().texts(EntryKind::Output)
}

fn errors(session: &Session) -> Vec<&str> {
    session.transcript().texts(EntryKind::Error)
}

// =============================================================================
// Test spawners
// =============================================================================

/// Wraps a spawner and records every command posted to its workers.
struct RecordingSpawner {
    inner: ThreadSpawner,
    commands: Arc<Mutex<Vec<&'static str>>>,
}

struct RecordingHandle {
    inner: Box<dyn WorkerHandle>,
    commands: Arc<Mutex<Vec<&'static str>>>,
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(&mut self, buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError> {
        let link = self.inner.spawn(buffer)?;
        Ok(WorkerLink {
            handle: Box::new(RecordingHandle {
                inner: link.handle,
                commands: Arc::clone(&self.commands),
            }),
            events: link.events,
        })
    }
}

impl WorkerHandle for RecordingHandle {
    fn post(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        self.commands.lock().unwrap().push(command.action());
        self.inner.post(command)
    }

    fn terminate(&mut self) {
        self.inner.terminate();
    }
}

/// A worker that boots fine and then dies on its first `run`.
struct CrashingSpawner;

struct CrashingHandle(Option<Sender<WorkerEvent>>);

impl WorkerSpawner for CrashingSpawner {
    fn spawn(&mut self, _buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError> {
        let (events_tx, events) = mpsc::channel();
        Ok(WorkerLink {
            handle: Box::new(CrashingHandle(Some(events_tx))),
            events,
        })
    }
}

impl WorkerHandle for CrashingHandle {
    fn post(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        match command {
            WorkerCommand::Init { .. } => {
                let events = self.0.as_ref().ok_or(TransportError::Disconnected)?;
                events.send(WorkerEvent::init_ok()).map_err(|_| TransportError::Disconnected)
            }
            WorkerCommand::Run { .. } => {
                self.0 = None;
                Ok(())
            }
        }
    }

    fn terminate(&mut self) {
        self.0 = None;
    }
}

/// A worker that never answers anything.
struct SilentSpawner(Vec<Sender<WorkerEvent>>);

struct SilentHandle;

impl WorkerSpawner for SilentSpawner {
    fn spawn(&mut self, _buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError> {
        let (events_tx, events) = mpsc::channel();
        // Keep the sender alive so the link looks healthy.
        self.0.push(events_tx);
        Ok(WorkerLink {
            handle: Box::new(SilentHandle),
            events,
        })
    }
}

impl WorkerHandle for SilentHandle {
    fn post(&mut self, _command: WorkerCommand) -> Result<(), TransportError> {
        Ok(())
    }

    fn terminate(&mut self) {}
}

/// A worker that acknowledges `init` and otherwise only emits what the test
/// sends through [`ScriptedSpawner::send`].
#[derive(Clone, Default)]
struct ScriptedSpawner(Arc<Mutex<Option<Sender<WorkerEvent>>>>);

struct ScriptedHandle(Sender<WorkerEvent>);

impl ScriptedSpawner {
    /// Emits `event` from the most recently spawned worker.
    fn send(&self, event: WorkerEvent) {
        let events = self.0.lock().unwrap();
        events.as_ref().expect("no worker spawned").send(event).unwrap();
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&mut self, _buffer: &Arc<dyn SharedBuffer>) -> Result<WorkerLink, TransportError> {
        let (events_tx, events) = mpsc::channel();
        *self.0.lock().unwrap() = Some(events_tx.clone());
        Ok(WorkerLink {
            handle: Box::new(ScriptedHandle(events_tx)),
            events,
        })
    }
}

impl WorkerHandle for ScriptedHandle {
    fn post(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        if let WorkerCommand::Init { .. } = command {
            self.0.send(WorkerEvent::init_ok()).map_err(|_| TransportError::Disconnected)?;
        }
        Ok(())
    }

    fn terminate(&mut self) {}
}

/// Mini interpreters that count how many instances are alive.
struct CountingFactory {
    inner: MiniFactory,
    live: Arc<AtomicUsize>,
}

struct Counted {
    inner: Box<dyn Interpreter>,
    live: Arc<AtomicUsize>,
}

impl InterpreterFactory for CountingFactory {
    fn boot(&self, config: &BootConfig) -> Result<Box<dyn Interpreter>, BootError> {
        let inner = self.inner.boot(config)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Counted {
            inner,
            live: Arc::clone(&self.live),
        }))
    }
}

impl Interpreter for Counted {
    fn load_packages_from_imports(&mut self, code: &str, io: &mut dyn ScriptIo) -> Result<(), ScriptError> {
        self.inner.load_packages_from_imports(code, io)
    }

    fn run(&mut self, code: &str, io: &mut dyn ScriptIo) -> Result<Option<String>, ScriptError> {
        self.inner.run(code, io)
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn start_reaches_ready() {
    let mut session = session();
    assert_eq!(session.state(), SessionState::Uninitialized);
    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.state().to_string(), "READY");
}

#[test]
fn first_statement_starts_the_session() {
    let mut session = session();
    type_lines(&mut session, &["x = 1 + 2", "x"]);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(outputs(&session), vec!["3"]);
    assert_eq!(
        session.transcript().texts(EntryKind::Input),
        vec!["x = 1 + 2", "x"]
    );
    assert_eq!(session.history().entries(), ["x = 1 + 2", "x"]);
}

#[test]
fn boot_failure_leaves_session_uninitialized() {
    let mut session = session_with(
        SessionConfig::new().package("numpy"),
        ThreadSpawner::new(Arc::new(MiniFactory::new())),
    );
    let err = session.start().unwrap_err();
    assert!(
        matches!(&err, SessionError::Boot(BootError(reason)) if reason == "package 'numpy' is not available"),
        "{err:?}"
    );
    assert_eq!(session.state(), SessionState::Uninitialized);

    // Running retries the boot and fails the same way.
    assert!(matches!(session.submit("1"), Err(SessionError::Boot(_))));
    assert!(!session.is_run_pending());
}

#[test]
fn init_timeout_tears_down_the_worker() {
    let mut session = session_with(SessionConfig::new().init_timeout_ms(50), SilentSpawner(Vec::new()));
    let err = session.start().unwrap_err();
    assert!(matches!(err, SessionError::InitTimeout(limit) if limit == Duration::from_millis(50)));
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn restart_discards_interpreter_state() {
    let mut session = session();
    type_lines(&mut session, &["x = 1"]);
    session.restart().unwrap();
    type_lines(&mut session, &["x"]);
    assert_eq!(errors(&session), vec!["NameError: name 'x' is not defined"]);
}

#[test]
fn repeated_starts_keep_one_live_interpreter() {
    let live = Arc::new(AtomicUsize::new(0));
    let factory = CountingFactory {
        inner: MiniFactory::new(),
        live: Arc::clone(&live),
    };
    let mut session = session_with(SessionConfig::new(), ThreadSpawner::new(Arc::new(factory)));
    session.start().unwrap();
    session.start().unwrap();
    session.restart().unwrap();
    assert!(eventually(|| live.load(Ordering::SeqCst) == 1), "live = {live:?}");

    drop(session);
    assert!(eventually(|| live.load(Ordering::SeqCst) == 0), "live = {live:?}");
}

#[test]
fn one_statement_posts_exactly_one_run() {
    let commands = Arc::new(Mutex::new(Vec::new()));
    let spawner = RecordingSpawner {
        inner: ThreadSpawner::new(Arc::new(MiniFactory::new())),
        commands: Arc::clone(&commands),
    };
    let mut session = session_with(SessionConfig::new(), spawner);
    type_lines(&mut session, &["x = 1"]);
    assert_eq!(*commands.lock().unwrap(), vec!["init", "run"]);
}

#[test]
fn worker_crash_rejects_pending_run() {
    let mut session = session_with(SessionConfig::new(), CrashingSpawner);
    session.submit("1").unwrap();
    let err = session.wait(WAIT).unwrap_err();
    assert!(
        matches!(err, SessionError::Transport(TransportError::Disconnected)),
        "{err:?}"
    );
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(!session.is_run_pending());
    assert_eq!(
        session.last_run(),
        Some(&RunOutcome::Failed {
            error: "worker disconnected".to_owned()
        })
    );
}

#[test]
fn teardown_rejects_pending_run_and_session_can_restart() {
    let mut session = session();
    session.handle_line("input()").unwrap();
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::AwaitingInput { prompt: None });

    let rejected = session.teardown();
    assert!(
        matches!(rejected, Some(TransportError::Terminated { pending: "run" })),
        "{rejected:?}"
    );
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(!session.is_awaiting_input());
    assert!(session.teardown().is_none(), "second teardown has nothing to reject");

    type_lines(&mut session, &["1 + 1"]);
    assert_eq!(outputs(&session), vec!["2"]);
}

// =============================================================================
// Statements and runtime input
// =============================================================================

#[test]
fn block_statement_is_submitted_once_complete() {
    let mut session = session();
    assert_eq!(session.handle_line("if 1 == 1:").unwrap(), LineOutcome::Incomplete);
    assert_eq!(session.handle_line("    print('yes')").unwrap(), LineOutcome::Incomplete);
    assert!(!session.is_run_pending());
    assert_eq!(
        session.handle_line("").unwrap(),
        LineOutcome::Statement("if 1 == 1:\n    print('yes')\n\n".to_owned())
    );
    session.wait(WAIT).unwrap();
    assert_eq!(session.history().entries(), ["if 1 == 1:\n    print('yes')"]);
    assert_eq!(
        session.transcript().texts(EntryKind::Input),
        vec!["if 1 == 1:\n    print('yes')"]
    );
    assert_eq!(outputs(&session), vec!["yes"]);
    assert!(errors(&session).is_empty());
}

#[test]
fn runtime_input_is_delivered_not_submitted() {
    let mut session = session();
    session.handle_line("name = input('who? ')").unwrap();
    assert_eq!(
        session.wait(WAIT).unwrap(),
        WaitOutcome::AwaitingInput {
            prompt: Some("who? ".to_owned())
        }
    );
    assert!(session.is_awaiting_input());

    assert_eq!(
        session.handle_line("bob").unwrap(),
        LineOutcome::RuntimeInput("bob".to_owned())
    );
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::Idle);
    type_lines(&mut session, &["name"]);

    assert_eq!(session.history().entries(), ["name = input('who? ')", "name"]);
    assert_eq!(outputs(&session), vec!["who? ", "'bob'"]);
    assert_eq!(
        session.transcript().texts(EntryKind::Input),
        vec!["name = input('who? ')", "bob", "name"]
    );
}

#[test]
fn successive_input_requests_get_fresh_lines() {
    let mut session = session();
    type_lines(&mut session, &["a = input()", "x", "b = input()", "y", "a + b"]);
    assert_eq!(outputs(&session), vec!["'xy'"]);
}

#[test]
fn input_request_clears_stale_buffer_content() {
    let buffer = Arc::new(MemoryBuffer::new());
    let mut session = session_sharing(
        &buffer,
        SessionConfig::new(),
        ThreadSpawner::new(Arc::new(MiniFactory::new())),
    );
    session.handle_line("input()").unwrap();
    session.wait(WAIT).unwrap();
    assert_eq!(buffer.read().unwrap(), BufferContent::Empty);
    session.handle_line("ok").unwrap();
    assert_eq!(
        buffer.read().unwrap(),
        BufferContent::Line {
            request: 0,
            sequence: 0,
            text: "ok".to_owned()
        }
    );
    session.wait(WAIT).unwrap();
    assert_eq!(outputs(&session), vec!["'ok'"]);
}

#[test]
fn second_run_while_pending_is_rejected() {
    let mut session = session();
    session.handle_line("input()").unwrap();
    session.wait(WAIT).unwrap();
    assert!(matches!(session.submit("1"), Err(SessionError::RunInFlight)));

    session.deliver_input("done").unwrap();
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::Idle);
    assert_eq!(
        session.last_run(),
        Some(&RunOutcome::Completed {
            output: Some("'done'".to_owned())
        })
    );
}

#[test]
fn deliver_input_without_request_fails() {
    let mut session = session();
    session.start().unwrap();
    assert!(matches!(session.deliver_input("x"), Err(SessionError::NotAwaitingInput)));
}

#[test]
fn input_timeout_surfaces_as_run_error() {
    let mut session = session_with(
        SessionConfig::new().input_timeout_ms(50).poll_interval_ms(5),
        ThreadSpawner::new(Arc::new(MiniFactory::new())),
    );
    session.handle_line("input('? ')").unwrap();
    assert!(matches!(session.wait(WAIT).unwrap(), WaitOutcome::AwaitingInput { .. }));
    // Waiting again without answering keeps pumping until the worker gives up.
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::Idle);
    assert!(!session.is_awaiting_input());
    assert_eq!(errors(&session), vec!["TimeoutError: no input received within 50ms"]);
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn answer_typed_after_input_timeout_never_reaches_a_later_prompt() {
    let mut session = session_with(
        SessionConfig::new().input_timeout_ms(200).poll_interval_ms(5),
        ThreadSpawner::new(Arc::new(MiniFactory::new())),
    );
    session.handle_line("a = input('first? ')").unwrap();
    assert!(matches!(session.wait(WAIT).unwrap(), WaitOutcome::AwaitingInput { .. }));
    // Give the worker time to give up on the prompt.
    thread::sleep(Duration::from_millis(600));

    assert!(matches!(
        session.handle_line("late answer"),
        Err(SessionError::NotAwaitingInput)
    ));
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::Idle);

    session.handle_line("input('second? ')").unwrap();
    assert_eq!(
        session.wait(WAIT).unwrap(),
        WaitOutcome::AwaitingInput {
            prompt: Some("second? ".to_owned())
        }
    );
    session.handle_line("fresh").unwrap();
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::Idle);
    assert_eq!(
        session.last_run(),
        Some(&RunOutcome::Completed {
            output: Some("'fresh'".to_owned())
        })
    );
    assert_eq!(errors(&session), vec!["TimeoutError: no input received within 200ms"]);
}

#[test]
fn answer_after_run_reply_is_rejected_and_not_written() {
    let buffer = Arc::new(MemoryBuffer::new());
    let worker = ScriptedSpawner::default();
    let mut session = session_sharing(&buffer, SessionConfig::new(), worker.clone());
    session.handle_line("a = input('first? ')").unwrap();
    worker.send(WorkerEvent::Input {
        request: 0,
        text: Some("first? ".to_owned()),
    });
    assert!(matches!(session.wait(WAIT).unwrap(), WaitOutcome::AwaitingInput { .. }));

    // The worker ends the run before the user answers.
    worker.send(WorkerEvent::run_failed("TimeoutError: no input received within 50ms"));
    assert!(matches!(
        session.handle_line("late answer"),
        Err(SessionError::NotAwaitingInput)
    ));
    assert_eq!(buffer.read().unwrap(), BufferContent::Empty);
    assert!(!session.is_awaiting_input());
    assert!(!session.is_run_pending());
    assert_eq!(session.history().entries(), ["a = input('first? ')"]);
    assert_eq!(
        session.transcript().texts(EntryKind::Input),
        vec!["a = input('first? ')"]
    );
}

#[test]
fn answers_are_stamped_with_the_request_they_answer() {
    let buffer = Arc::new(MemoryBuffer::new());
    let worker = ScriptedSpawner::default();
    let mut session = session_sharing(&buffer, SessionConfig::new(), worker.clone());
    session.submit("input()").unwrap();
    worker.send(WorkerEvent::Input { request: 4, text: None });
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::AwaitingInput { prompt: None });

    // The answer lands while the worker's timeout reply is still in flight.
    session.deliver_input("late").unwrap();
    assert_eq!(
        buffer.read().unwrap(),
        BufferContent::Line {
            request: 4,
            sequence: 0,
            text: "late".to_owned()
        }
    );
    worker.send(WorkerEvent::run_failed("TimeoutError: no input received within 50ms"));
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::Idle);

    session.submit("input()").unwrap();
    worker.send(WorkerEvent::Input { request: 5, text: None });
    assert_eq!(session.wait(WAIT).unwrap(), WaitOutcome::AwaitingInput { prompt: None });
    assert_eq!(buffer.read().unwrap(), BufferContent::Empty);
    session.deliver_input("fresh").unwrap();
    assert_eq!(
        buffer.read().unwrap(),
        BufferContent::Line {
            request: 5,
            sequence: 1,
            text: "fresh".to_owned()
        }
    );
}

// =============================================================================
// Rendering
// =============================================================================

#[test]
fn script_error_renders_inline_and_session_stays_ready() {
    let mut session = session();
    type_lines(&mut session, &["undefined_name", "1"]);
    assert_eq!(errors(&session), vec!["NameError: name 'undefined_name' is not defined"]);
    assert_eq!(outputs(&session), vec!["1"]);
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn stderr_is_rendered_as_error() {
    let mut session = session();
    type_lines(&mut session, &["import sys", "sys.stderr.write('careful')"]);
    assert_eq!(errors(&session), vec!["careful"]);
    assert_eq!(outputs(&session), vec!["7"]);
}

#[test]
fn history_recall_is_gated_by_cursor_line() {
    let mut session = session();
    type_lines(&mut session, &["x = 1", "x"]);

    let single = CursorLine::locate("", 0, 0);
    assert_eq!(session.history_mut().recall(Recall::Previous, single), Some("x"));
    assert_eq!(session.history_mut().recall(Recall::Previous, single), Some("x = 1"));

    let area = "if x:\n    y";
    let first_line = CursorLine::locate(area, 2, 2);
    let last_line = CursorLine::locate(area, area.len(), area.len());
    assert_eq!(session.history_mut().recall(Recall::Next, first_line), None);
    assert_eq!(session.history_mut().recall(Recall::Next, last_line), Some("x"));
    assert_eq!(session.history_mut().recall(Recall::Next, last_line), Some(""));
    assert_eq!(session.history().cursor(), 2);
}

#[test]
fn clear_console_keeps_session_state() {
    let mut session = session();
    type_lines(&mut session, &["x = 41", "x + 1"]);
    session.clear_console();
    assert!(session.transcript().entries().is_empty());

    type_lines(&mut session, &["x"]);
    assert_eq!(outputs(&session), vec!["41"]);
    assert_eq!(session.history().len(), 3);
}

#[test]
fn wait_times_out_while_run_is_pending() {
    let mut session = session_with(SessionConfig::new(), ScriptedSpawner::default());
    session.submit("1").unwrap();
    assert_eq!(session.wait(Some(Duration::from_millis(20))).unwrap(), WaitOutcome::TimedOut);
    assert!(session.is_run_pending());
    session.poll().unwrap();
    assert!(session.is_run_pending());

    let rejected = session.teardown();
    assert!(matches!(rejected, Some(TransportError::Terminated { pending: "run" })));
    assert_eq!(
        session.last_run(),
        Some(&RunOutcome::Failed {
            error: "worker terminated while a run request was pending".to_owned()
        })
    );
}

// =============================================================================
// Running a whole source
// =============================================================================

#[test]
fn run_source_clears_transcript_and_restarts() {
    let mut session = session();
    type_lines(&mut session, &["kept = 1", "kept"]);

    let source = TextSource::new("main.py", "print('a')\nprint('b')\nkept");
    session.run_source(&source).unwrap();
    session.wait(WAIT).unwrap();

    let entries = session.transcript().entries();
    assert_eq!(entries[0].kind, EntryKind::Info);
    assert_eq!(entries[0].text, "initializing");
    assert_eq!(outputs(&session), vec!["a", "b"]);
    assert_eq!(errors(&session), vec!["NameError: name 'kept' is not defined"]);
}

#[test]
fn run_source_reads_file_contents() {
    let mut file = tempfile::Builder::new().suffix(".py").tempfile().unwrap();
    writeln!(file, "greeting = 'hi'\nprint(greeting + ' file')").unwrap();

    let mut session = session();
    let source = FileSource::new(file.path());
    assert!(session.config().is_runnable(&file.path().display().to_string()));
    session.run_source(&source).unwrap();
    session.wait(WAIT).unwrap();
    assert_eq!(outputs(&session), vec!["hi file"]);
}

#[test]
fn run_source_reports_unreadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session();
    let err = session
        .run_source(&FileSource::new(dir.path().join("missing.py")))
        .unwrap_err();
    assert!(matches!(err, SessionError::Source { .. }), "{err:?}");
    assert_eq!(session.state(), SessionState::Uninitialized);
}
