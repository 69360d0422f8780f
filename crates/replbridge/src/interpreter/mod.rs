//! The seam between the execution worker and the interpreter it hosts.
//!
//! The worker treats the interpreter as a black box: it boots one through an
//! [`InterpreterFactory`], hands it source text, and services its I/O through
//! a [`ScriptIo`] callback object. Output calls become protocol messages;
//! `stdin` becomes a blocking rendezvous on the shared buffer.

mod mini;

pub use mini::{MiniFactory, MiniInterpreter};

use crate::error::{BootError, HostIoError, ScriptError};

/// Boot parameters forwarded from the `init` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    /// Interpreter asset base.
    pub base_url: String,
    /// Packages to preload before reporting success.
    pub packages: Vec<String>,
}

/// I/O callbacks available to a running statement.
///
/// Every method may fail when the controller has gone away or the session was
/// torn down; interpreters should abort the running statement on error.
pub trait ScriptIo {
    /// Called once per write to standard output.
    fn stdout(&mut self, text: &str) -> Result<(), HostIoError>;

    /// Called once per write to standard error.
    fn stderr(&mut self, text: &str) -> Result<(), HostIoError>;

    /// Blocks until the user supplies one line of input.
    ///
    /// # Arguments
    /// * `prompt` - Text to show the user, if any.
    fn stdin(&mut self, prompt: Option<&str>) -> Result<String, HostIoError>;
}

/// One live interpreter instance.
///
/// Not required to be `Send`: instances are created inside the worker's own
/// execution context and never leave it.
pub trait Interpreter {
    /// Loads any packages that `code` imports and are not loaded yet.
    fn load_packages_from_imports(&mut self, code: &str, io: &mut dyn ScriptIo) -> Result<(), ScriptError>;

    /// Executes `code`, returning the display form of its result value, if any.
    fn run(&mut self, code: &str, io: &mut dyn ScriptIo) -> Result<Option<String>, ScriptError>;
}

/// Creates interpreter instances for workers.
pub trait InterpreterFactory: Send + Sync {
    /// Boots a fresh interpreter.
    fn boot(&self, config: &BootConfig) -> Result<Box<dyn Interpreter>, BootError>;
}
