use std::{
    io::Write as _,
    process::{Command, Output, Stdio},
};

use replbridge::{FileBuffer, SessionConfig, SharedBuffer, WorkerCommand, protocol::encode_frame};

fn run_cli(args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_replbridge"))
        .args(args)
        .env_remove("REPLBRIDGE_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(stdin.as_bytes()).unwrap();
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

const SESSION: &str = "x = 40 + 2\nx\nname = input('who? ')\nbob\nprint('hi ' + name)\n";

fn assert_session_output(output: &Output) {
    assert!(output.status.success(), "stderr: {}", stderr(output));
    let out = stdout(output);
    assert!(out.contains(">>> "), "{out}");
    assert!(out.contains("42\n"), "{out}");
    assert!(out.contains("who? \n"), "{out}");
    assert!(out.contains("hi bob\n"), "{out}");
}

// =============================================================================
// Interactive sessions
// =============================================================================

#[test]
fn thread_worker_session() {
    assert_session_output(&run_cli(&[], SESSION));
}

#[test]
fn process_worker_session() {
    assert_session_output(&run_cli(&["--process"], SESSION));
}

#[test]
fn script_errors_go_to_stderr() {
    let output = run_cli(&[], "missing\n1 + 1\n");
    assert!(output.status.success());
    assert!(
        stderr(&output).contains("NameError: name 'missing' is not defined"),
        "{}",
        stderr(&output)
    );
    assert!(stdout(&output).contains("2\n"));
}

#[test]
fn continuation_prompt_for_blocks() {
    let output = run_cli(&[], "x = 2\nif x == 2:\n    print('two')\nelse:\n    print('other')\n\n");
    let out = stdout(&output);
    assert!(out.contains("... "), "{out}");
    assert!(out.contains("two\n"), "{out}");
    assert!(!out.contains("other\n"), "{out}");
    assert!(stderr(&output).is_empty(), "{}", stderr(&output));
}

#[test]
fn history_command_lists_statements() {
    let output = run_cli(&[], "x = 1\nname = input()\nnot history\n:history\n");
    let out = stdout(&output);
    assert!(out.contains("   1  x = 1\n"), "{out}");
    assert!(out.contains("   2  name = input()\n"), "{out}");
    assert!(!out.contains("not history\n"), "runtime input must stay out of history: {out}");
}

#[test]
fn quit_command_ends_session() {
    let output = run_cli(&[], ":quit\nprint('unreachable')\n");
    assert!(output.status.success());
    assert!(!stdout(&output).contains("unreachable\n"));
}

#[test]
fn boot_failure_is_reported() {
    let output = run_cli(&["--package", "numpy"], "1\n");
    assert!(output.status.success());
    assert!(
        stderr(&output).contains("package 'numpy' is not available"),
        "{}",
        stderr(&output)
    );
}

// =============================================================================
// Running files
// =============================================================================

#[test]
fn runs_file_before_interactive_session() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.py");
    std::fs::write(&script, "msg = 'from file'\nprint(msg)\n").unwrap();

    let output = run_cli(&[script.to_str().unwrap()], "msg + '!'\n");
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("from file\n"), "{out}");
    assert!(out.contains("'from file!'\n"), "{out}");
}

#[test]
fn rejects_non_runnable_file() {
    let dir = tempfile::tempdir().unwrap();
    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, "hello\n").unwrap();

    let output = run_cli(&[notes.to_str().unwrap()], "");
    assert!(!output.status.success());
    assert!(stderr(&output).contains("is not a runnable file"), "{}", stderr(&output));
}

#[test]
fn config_file_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("session.json");
    std::fs::write(&config, r#"{"packages": ["numpy"], "poll_interval_ms": 5}"#).unwrap();

    let output = run_cli(&["--config", config.to_str().unwrap()], "");
    assert!(output.status.success());
    assert!(
        stderr(&output).contains("package 'numpy' is not available"),
        "{}",
        stderr(&output)
    );
}

#[test]
fn invalid_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("session.json");
    std::fs::write(&config, "{ not json").unwrap();

    let output = run_cli(&["--config", config.to_str().unwrap()], "");
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid config"), "{}", stderr(&output));
}

// =============================================================================
// Worker mode
// =============================================================================

#[test]
fn worker_mode_speaks_json_lines() {
    let buffer = FileBuffer::temporary().unwrap();
    let mut input = encode_frame(&WorkerCommand::init(&SessionConfig::new(), buffer.url())).unwrap();
    input.push_str(&encode_frame(&WorkerCommand::Run { code: "2 + 3".to_owned() }).unwrap());

    let output = run_cli(&["--worker"], &input);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let lines: Vec<String> = stdout(&output).lines().map(str::to_owned).collect();
    assert_eq!(
        lines,
        vec![
            r#"{"action":"init","success":true}"#.to_owned(),
            r#"{"action":"run","success":true,"output":"5"}"#.to_owned(),
        ]
    );
}
