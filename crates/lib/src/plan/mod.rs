//! Plans: the ordered collection of target definitions a build starts from.
//!
//! A [`Plan`] is an immutable description. It is re-created from scratch on
//! every parse and handed to the graph builder; nothing in it carries build
//! state.
//!
//! # Submodules
//!
//! - [`file`] - loading plans from `strata.toml`

pub mod file;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandRef};
use crate::value::Value;

/// A dynamic transform over upstream sequence-valued targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
  /// One sub-target per position; upstreams are paired positionally.
  Map { over: Vec<String> },

  /// One sub-target per element of the Cartesian product.
  Cross { over: Vec<String> },

  /// One sub-target per distinct value of `by`.
  Group { over: String, by: String },
}

impl Transform {
  pub fn map<I, S>(over: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Transform::Map {
      over: over.into_iter().map(Into::into).collect(),
    }
  }

  pub fn cross<I, S>(over: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Transform::Cross {
      over: over.into_iter().map(Into::into).collect(),
    }
  }

  pub fn group(over: impl Into<String>, by: impl Into<String>) -> Self {
    Transform::Group {
      over: over.into(),
      by: by.into(),
    }
  }

  /// Upstream names the transform slices, in declaration order.
  pub fn upstreams(&self) -> Vec<&str> {
    match self {
      Transform::Map { over } | Transform::Cross { over } => over.iter().map(String::as_str).collect(),
      Transform::Group { over, by } => vec![over.as_str(), by.as_str()],
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Transform::Map { .. } => "map",
      Transform::Cross { .. } => "cross",
      Transform::Group { .. } => "group",
    }
  }
}

/// Dynamic expansion attached to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSpec {
  pub transform: Transform,

  /// Record which keys produced each sub-target.
  #[serde(default)]
  pub trace: bool,
}

impl DynamicSpec {
  pub fn new(transform: Transform) -> Self {
    Self { transform, trace: false }
  }

  pub fn traced(mut self) -> Self {
    self.trace = true;
    self
  }
}

impl From<Transform> for DynamicSpec {
  fn from(transform: Transform) -> Self {
    Self::new(transform)
  }
}

/// The definition of one target.
#[derive(Debug, Clone)]
pub struct TargetDef {
  pub name: String,
  pub command: CommandRef,
  /// Explicit dependencies on top of what the command references.
  pub deps: Vec<String>,
  pub files_in: Vec<PathBuf>,
  pub files_out: Vec<PathBuf>,
  pub dynamic: Option<DynamicSpec>,
  /// Free-form columns carried along for reporting.
  pub metadata: BTreeMap<String, Value>,
}

impl TargetDef {
  pub fn new(name: impl Into<String>, command: impl Command + 'static) -> Self {
    Self::from_ref(name, Arc::new(command))
  }

  pub fn from_ref(name: impl Into<String>, command: CommandRef) -> Self {
    Self {
      name: name.into(),
      command,
      deps: Vec::new(),
      files_in: Vec::new(),
      files_out: Vec::new(),
      dynamic: None,
      metadata: BTreeMap::new(),
    }
  }

  pub fn dep(mut self, name: impl Into<String>) -> Self {
    self.deps.push(name.into());
    self
  }

  pub fn file_in(mut self, path: impl Into<PathBuf>) -> Self {
    self.files_in.push(path.into());
    self
  }

  pub fn file_out(mut self, path: impl Into<PathBuf>) -> Self {
    self.files_out.push(path.into());
    self
  }

  pub fn dynamic(mut self, spec: impl Into<DynamicSpec>) -> Self {
    self.dynamic = Some(spec.into());
    self
  }

  pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
    self.metadata.insert(key.into(), value);
    self
  }

  /// Every identifier this target depends on: references inside the
  /// command, explicit deps and dynamic upstreams, sorted and de-duplicated.
  pub fn references(&self) -> Vec<String> {
    let mut names: Vec<String> = self.command.references();
    names.extend(self.deps.iter().cloned());
    if let Some(spec) = &self.dynamic {
      names.extend(spec.transform.upstreams().into_iter().map(String::from));
    }
    names.sort();
    names.dedup();
    names
  }

  /// Declared and command-embedded file inputs.
  pub fn all_files_in(&self) -> Vec<PathBuf> {
    merge_paths(&self.files_in, self.command.files_in())
  }

  /// Declared and command-embedded file outputs.
  pub fn all_files_out(&self) -> Vec<PathBuf> {
    merge_paths(&self.files_out, self.command.files_out())
  }
}

fn merge_paths(declared: &[PathBuf], embedded: Vec<PathBuf>) -> Vec<PathBuf> {
  let mut paths: Vec<PathBuf> = declared.to_vec();
  paths.extend(embedded);
  paths.sort();
  paths.dedup();
  paths
}

/// An ordered collection of target definitions plus named imports.
///
/// Imports are plain values targets may reference. They are the default
/// bindings for references with no matching target.
#[derive(Debug, Clone, Default)]
pub struct Plan {
  targets: Vec<TargetDef>,
  imports: BTreeMap<String, Value>,
}

impl Plan {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn target(mut self, def: TargetDef) -> Self {
    self.targets.push(def);
    self
  }

  pub fn import(mut self, name: impl Into<String>, value: Value) -> Self {
    self.imports.insert(name.into(), value);
    self
  }

  pub fn add_target(&mut self, def: TargetDef) {
    self.targets.push(def);
  }

  pub fn add_import(&mut self, name: impl Into<String>, value: Value) {
    self.imports.insert(name.into(), value);
  }

  pub fn targets(&self) -> &[TargetDef] {
    &self.targets
  }

  pub fn imports(&self) -> &BTreeMap<String, Value> {
    &self.imports
  }

  pub fn get(&self, name: &str) -> Option<&TargetDef> {
    self.targets.iter().find(|t| t.name == name)
  }
}
