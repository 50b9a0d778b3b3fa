//! Target commands.
//!
//! A command is anything callable that declares its inputs and returns a
//! serializable value. The engine never looks inside a command beyond what
//! it declares through the [`Command`] trait:
//! - [`Command::body`] is the canonical text that gets fingerprinted
//! - [`Command::references`] lists the targets/imports the command reads
//! - [`Command::files_in`] / [`Command::files_out`] are file markers
//!
//! # Submodules
//!
//! - [`placeholder`] - `$${...}` reference parsing for shell scripts
//! - [`shell`] - commands that run a shell script

pub mod placeholder;
pub mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::value::Value;

pub use shell::ShellCommand;

/// Errors raised by a command at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
  /// The command reported a failure.
  #[error("{0}")]
  Failed(String),

  /// A shell command exited unsuccessfully.
  #[error("command exited with code {code:?}: {stderr}")]
  Exit { code: Option<i32>, stderr: String },

  /// The command asked for an input that was not provided.
  #[error("missing input: {0}")]
  MissingInput(String),

  /// I/O error while running the command.
  #[error("io error: {0}")]
  Io(String),

  /// The command panicked.
  #[error("command panicked: {0}")]
  Panicked(String),
}

impl CommandError {
  pub fn failed(message: impl Into<String>) -> Self {
    CommandError::Failed(message.into())
  }
}

impl From<std::io::Error> for CommandError {
  fn from(e: std::io::Error) -> Self {
    CommandError::Io(e.to_string())
  }
}

/// Everything a command receives when it runs.
#[derive(Debug, Clone)]
pub struct CommandInput {
  /// Name of the target (or sub-target) being built.
  pub target: String,

  /// Values of the dependencies, keyed by name. For sub-targets the mapped
  /// upstreams hold the slice rather than the whole sequence.
  pub values: BTreeMap<String, Value>,

  /// Project root; relative file markers resolve against it.
  pub root: PathBuf,
}

impl CommandInput {
  pub fn get(&self, name: &str) -> Result<&Value, CommandError> {
    self
      .values
      .get(name)
      .ok_or_else(|| CommandError::MissingInput(name.to_string()))
  }
}

/// The capability interface every target command implements.
pub trait Command: Send + Sync + fmt::Debug {
  /// Canonical text of the command used for fingerprinting.
  fn body(&self) -> String;

  /// Identifiers of targets or imports this command reads.
  fn references(&self) -> Vec<String> {
    Vec::new()
  }

  /// File inputs declared inside the command.
  fn files_in(&self) -> Vec<PathBuf> {
    Vec::new()
  }

  /// File outputs declared inside the command.
  fn files_out(&self) -> Vec<PathBuf> {
    Vec::new()
  }

  /// Runtime environment recorded alongside the cached value.
  fn env_capture(&self) -> BTreeMap<String, String> {
    BTreeMap::new()
  }

  /// Run the command.
  fn run(&self, input: &CommandInput) -> Result<Value, CommandError>;
}

/// Shared handle to a command.
pub type CommandRef = Arc<dyn Command>;

type CommandFn = dyn Fn(&CommandInput) -> Result<Value, CommandError> + Send + Sync;

/// A command backed by a Rust closure.
///
/// Closures cannot be serialized, so the caller supplies the body text that
/// stands for the closure in fingerprints. Change the body whenever the
/// closure's behavior changes.
#[derive(Clone)]
pub struct FnCommand {
  body: String,
  reads: Vec<String>,
  env: BTreeMap<String, String>,
  func: Arc<CommandFn>,
}

impl FnCommand {
  pub fn new<F>(body: impl Into<String>, func: F) -> Self
  where
    F: Fn(&CommandInput) -> Result<Value, CommandError> + Send + Sync + 'static,
  {
    Self {
      body: body.into(),
      reads: Vec::new(),
      env: BTreeMap::new(),
      func: Arc::new(func),
    }
  }

  /// Declare targets or imports the closure reads.
  pub fn reads<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.reads.extend(names.into_iter().map(Into::into));
    self
  }

  /// Record an environment entry alongside cached values.
  pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }
}

impl fmt::Debug for FnCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnCommand")
      .field("body", &self.body)
      .field("reads", &self.reads)
      .finish_non_exhaustive()
  }
}

impl Command for FnCommand {
  fn body(&self) -> String {
    self.body.clone()
  }

  fn references(&self) -> Vec<String> {
    self.reads.clone()
  }

  fn env_capture(&self) -> BTreeMap<String, String> {
    self.env.clone()
  }

  fn run(&self, input: &CommandInput) -> Result<Value, CommandError> {
    (self.func)(input)
  }
}
