//! Shell-script commands.
//!
//! The script runs in a rebuilt environment so that the same inputs yield the
//! same output on any machine:
//! - the inherited environment is cleared
//! - `PATH` and `HOME` are passed through (scripts need their tools)
//! - `LANG`/`LC_ALL` are pinned to `C`
//! - `SOURCE_DATE_EPOCH` is fixed at 1980-01-01 (the ZIP epoch)
//! - `STRATA_TARGET` holds the target name, `STRATA_INPUTS` every input value as JSON
//! - user-specified variables are merged last
//!
//! Stdout is the command's value: parsed as JSON when possible, otherwise the
//! trimmed text.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command as Process;

use tracing::{debug, info};

use super::placeholder::{self, PlaceholderError, Resolver, Segment};
use super::{Command, CommandError, CommandInput};
use crate::value::{Value, render};

/// Reproducible timestamp: January 1, 1980 00:00:00 UTC.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// A command that runs a shell script.
#[derive(Debug, Clone)]
pub struct ShellCommand {
  script: String,
  segments: Vec<Segment>,
  env: BTreeMap<String, String>,
  shell: Option<String>,
}

impl ShellCommand {
  /// Parse `script`; fails on malformed placeholders.
  pub fn new(script: impl Into<String>) -> Result<Self, PlaceholderError> {
    let script = script.into();
    let segments = placeholder::parse(&script)?;
    Ok(Self {
      script,
      segments,
      env: BTreeMap::new(),
      shell: None,
    })
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env.extend(env);
    self
  }

  /// Run through `shell` instead of the platform default.
  pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
    self.shell = Some(shell.into());
    self
  }

  pub fn script(&self) -> &str {
    &self.script
  }
}

struct InputResolver<'a> {
  input: &'a CommandInput,
}

impl Resolver for InputResolver<'_> {
  fn resolve_ref(&self, name: &str) -> Result<String, PlaceholderError> {
    self
      .input
      .values
      .get(name)
      .map(render)
      .ok_or_else(|| PlaceholderError::Unresolved(name.to_string()))
  }

  fn resolve_file(&self, path: &str) -> Result<String, PlaceholderError> {
    Ok(self.input.root.join(path).display().to_string())
  }
}

impl Command for ShellCommand {
  fn body(&self) -> String {
    if self.env.is_empty() {
      return self.script.clone();
    }
    // env is fingerprinted along with the script
    let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{}\n#env {}", self.script, env.join(" "))
  }

  fn references(&self) -> Vec<String> {
    placeholder::references(&self.segments)
  }

  fn files_in(&self) -> Vec<PathBuf> {
    placeholder::files_in(&self.segments).into_iter().map(PathBuf::from).collect()
  }

  fn files_out(&self) -> Vec<PathBuf> {
    placeholder::files_out(&self.segments).into_iter().map(PathBuf::from).collect()
  }

  fn env_capture(&self) -> BTreeMap<String, String> {
    self.env.clone()
  }

  fn run(&self, input: &CommandInput) -> Result<Value, CommandError> {
    let script = placeholder::substitute_segments(&self.segments, &InputResolver { input })
      .map_err(|e| match e {
        PlaceholderError::Unresolved(name) => CommandError::MissingInput(name),
        other => CommandError::Failed(other.to_string()),
      })?;

    info!(name = %input.target, "running shell command");

    let (shell, args) = get_shell(self.shell.as_deref());
    let inputs = serde_json::to_string(&input.values).map_err(|e| CommandError::Failed(e.to_string()))?;

    let mut command = Process::new(&shell);
    command
      .args(&args)
      .arg(&script)
      .current_dir(&input.root)
      .env_clear()
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .env("STRATA_TARGET", &input.target)
      .env("STRATA_INPUTS", inputs);

    for key in ["PATH", "HOME", "SYSTEMROOT"] {
      if let Some(value) = std::env::var_os(key) {
        command.env(key, value);
      }
    }

    for (key, value) in &self.env {
      command.env(key, value);
    }

    debug!(shell = %shell, cwd = %input.root.display(), "spawning process");

    let output = command.output()?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      return Err(CommandError::Exit {
        code: output.status.code(),
        stderr,
      });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command output");
    }

    Ok(parse_output(&stdout))
  }
}

/// JSON if stdout parses as JSON, otherwise the text itself.
fn parse_output(stdout: &str) -> Value {
  serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string()))
}

/// Shell program and arguments for the current platform.
///
/// The default is `/bin/sh` rather than `$SHELL`: interactive shells may
/// source profile files that change the environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
