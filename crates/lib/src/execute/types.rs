//! Types for build execution.
//!
//! This module defines the configuration, per-target report and error types
//! of a build.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheError, StoreLockError};
use crate::command::CommandError;
use crate::dynamic::{ExpandError, LengthPolicy};
use crate::fingerprint::FingerprintError;
use crate::graph::GraphError;
use crate::history::HistoryError;
use crate::util::hash::Fingerprint;

/// What the scheduler does after a target fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
  /// Start nothing new; in-flight targets finish.
  #[default]
  Halt,
  /// Keep building everything that does not depend on the failure.
  Continue,
}

/// Configuration for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
  /// Maximum number of commands running at once.
  pub workers: usize,

  /// Append history records.
  pub history: bool,

  /// Cap on sub-targets per dynamic target.
  pub max_expand: Option<usize>,

  pub on_failure: OnFailure,

  pub length_policy: LengthPolicy,

  /// Build only these targets and their ancestors.
  pub targets: Option<Vec<String>>,
}

impl BuildConfig {
  /// The active policy for `map` over unequal lengths.
  pub fn length_policy(&self) -> LengthPolicy {
    self.length_policy
  }
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      workers: num_cpus(),
      history: true,
      max_expand: None,
      on_failure: OnFailure::default(),
      length_policy: LengthPolicy::default(),
      targets: None,
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// How one target ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
  /// The command ran and its value was stored.
  Built,
  /// The cache was current; the command was skipped.
  UpToDate,
  Failed {
    error: String,
  },
  /// Not attempted because something it needs failed.
  DependencyFailed {
    dependency: String,
  },
  /// Not attempted because the build halted.
  Cancelled,
}

impl TargetStatus {
  pub fn is_done(&self) -> bool {
    matches!(self, TargetStatus::Built | TargetStatus::UpToDate)
  }

  pub fn label(&self) -> &'static str {
    match self {
      TargetStatus::Built => "built",
      TargetStatus::UpToDate => "skipped",
      TargetStatus::Failed { .. } => "failed",
      TargetStatus::DependencyFailed { .. } => "dependency failed",
      TargetStatus::Cancelled => "cancelled",
    }
  }
}

/// Per-target outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetReport {
  #[serde(flatten)]
  pub status: TargetStatus,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub fingerprint: Option<Fingerprint>,

  /// Command wall time; zero when skipped.
  pub seconds: f64,

  /// Dynamic parent, for sub-targets.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub parent: Option<String>,
}

impl TargetReport {
  pub fn new(status: TargetStatus) -> Self {
    Self {
      status,
      fingerprint: None,
      seconds: 0.0,
      parent: None,
    }
  }
}

/// Result of a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildReport {
  pub targets: BTreeMap<String, TargetReport>,

  /// Sub-targets left out by `max_expand`.
  pub truncated: usize,
}

impl BuildReport {
  /// True when every target is built or up to date.
  pub fn is_success(&self) -> bool {
    self.targets.values().all(|t| t.status.is_done())
  }

  pub fn built(&self) -> Vec<&str> {
    self.with(|s| matches!(s, TargetStatus::Built))
  }

  pub fn skipped(&self) -> Vec<&str> {
    self.with(|s| matches!(s, TargetStatus::UpToDate))
  }

  /// Targets that failed, for any reason.
  pub fn failed(&self) -> Vec<&str> {
    self.with(|s| !s.is_done())
  }

  pub fn status(&self, name: &str) -> Option<&TargetStatus> {
    self.targets.get(name).map(|t| &t.status)
  }

  fn with(&self, pred: impl Fn(&TargetStatus) -> bool) -> Vec<&str> {
    self
      .targets
      .iter()
      .filter(|(_, t)| pred(&t.status))
      .map(|(name, _)| name.as_str())
      .collect()
  }
}

/// Why a single node failed. Contained to the node and its dependents.
#[derive(Debug, Error)]
pub enum NodeError {
  #[error(transparent)]
  Command(#[from] CommandError),

  #[error(transparent)]
  Expand(#[from] ExpandError),

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  History(#[from] HistoryError),

  #[error("sub-target name '{0}' collides with another target")]
  NameCollision(String),
}

/// Errors that abort a build before or outside any single node.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("build task failed: {0}")]
  Task(String),
}
