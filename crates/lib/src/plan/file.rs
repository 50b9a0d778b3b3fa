//! Loading plans from TOML plan files.
//!
//! ```toml
//! [config]
//! workers = 4
//!
//! [imports]
//! threshold = 3
//!
//! [[target]]
//! name = "numbers"
//! command = "echo '[1, 2, 3]'"
//!
//! [[target]]
//! name = "squares"
//! command = "echo $(( $${numbers} * $${numbers} ))"
//! dynamic = { map = ["numbers"] }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::{DynamicSpec, Plan, TargetDef, Transform};
use crate::command::ShellCommand;
use crate::command::placeholder::PlaceholderError;
use crate::dynamic::LengthPolicy;
use crate::execute::{BuildConfig, OnFailure};
use crate::value::Value;

/// Default plan file name.
pub const PLAN_FILE_NAME: &str = "strata.toml";

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to read plan file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse plan file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("target '{target}': {source}")]
  Placeholder {
    target: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("target '{target}': invalid dynamic spec: {message}")]
  InvalidDynamic { target: String, message: String },
}

/// Build defaults from the `[config]` table. CLI flags override these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
  pub workers: Option<usize>,
  pub max_expand: Option<usize>,
  pub on_failure: Option<OnFailure>,
  pub length_policy: Option<LengthPolicy>,
  pub history: Option<bool>,
  pub shell: Option<String>,
}

impl PlanConfig {
  /// Overlay the configured values onto `config`.
  pub fn apply(&self, config: &mut BuildConfig) {
    if let Some(workers) = self.workers {
      config.workers = workers.max(1);
    }
    if self.max_expand.is_some() {
      config.max_expand = self.max_expand;
    }
    if let Some(on_failure) = self.on_failure {
      config.on_failure = on_failure;
    }
    if let Some(policy) = self.length_policy {
      config.length_policy = policy;
    }
    if let Some(history) = self.history {
      config.history = history;
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
  #[serde(default)]
  config: PlanConfig,
  #[serde(default)]
  imports: BTreeMap<String, Value>,
  #[serde(default)]
  target: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetEntry {
  name: String,
  command: String,
  #[serde(default)]
  deps: Vec<String>,
  #[serde(default)]
  files_in: Vec<PathBuf>,
  #[serde(default)]
  files_out: Vec<PathBuf>,
  #[serde(default)]
  env: BTreeMap<String, String>,
  dynamic: Option<DynamicEntry>,
  #[serde(default)]
  meta: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DynamicEntry {
  map: Option<Vec<String>>,
  cross: Option<Vec<String>>,
  group: Option<String>,
  by: Option<String>,
  #[serde(default)]
  trace: bool,
}

impl DynamicEntry {
  fn into_spec(self, target: &str) -> Result<DynamicSpec, PlanError> {
    let invalid = |message: &str| PlanError::InvalidDynamic {
      target: target.to_string(),
      message: message.to_string(),
    };

    let transform = match (self.map, self.cross, self.group, self.by) {
      (Some(over), None, None, None) => Transform::Map { over },
      (None, Some(over), None, None) => Transform::Cross { over },
      (None, None, Some(over), Some(by)) => Transform::Group { over, by },
      (None, None, Some(_), None) => return Err(invalid("group requires 'by'")),
      _ => return Err(invalid("expected exactly one of map, cross or group")),
    };

    Ok(DynamicSpec {
      transform,
      trace: self.trace,
    })
  }
}

/// Read and parse a plan file.
pub fn load_plan(path: &Path) -> Result<(Plan, PlanConfig), PlanError> {
  let text = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  parse_plan(&text, path)
}

/// Parse plan file text. `path` is only used in error messages.
pub fn parse_plan(text: &str, path: &Path) -> Result<(Plan, PlanConfig), PlanError> {
  let file: PlanFile = toml::from_str(text).map_err(|e| PlanError::Parse {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;

  let mut plan = Plan::new();
  for (name, value) in file.imports {
    plan.add_import(name, value);
  }

  for entry in file.target {
    let mut command = ShellCommand::new(entry.command)
      .map_err(|source| PlanError::Placeholder {
        target: entry.name.clone(),
        source,
      })?
      .with_env(entry.env);
    if let Some(shell) = &file.config.shell {
      command = command.with_shell(shell.clone());
    }

    let mut def = TargetDef::from_ref(entry.name.clone(), Arc::new(command));
    def.deps = entry.deps;
    def.files_in = entry.files_in;
    def.files_out = entry.files_out;
    def.metadata = entry.meta;
    if let Some(dynamic) = entry.dynamic {
      def.dynamic = Some(dynamic.into_spec(&entry.name)?);
    }
    plan.add_target(def);
  }

  debug!(
    path = %path.display(),
    targets = plan.targets().len(),
    imports = plan.imports().len(),
    "loaded plan"
  );

  Ok((plan, file.config))
}
