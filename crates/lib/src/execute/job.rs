//! Units of blocking work dispatched by the scheduler.
//!
//! Each job runs on tokio's blocking pool and owns everything it needs, so
//! the scheduler never touches the filesystem or a user command itself.

use std::collections::{BTreeMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::types::NodeError;
use crate::cache::{CacheError, CacheStore, EntryKind, EntryMeta};
use crate::command::{CommandError, CommandInput, CommandRef};
use crate::dynamic::{self, DynamicIndex, ExpandRequest, Expansion, LengthPolicy};
use crate::fingerprint::{dynamic_fingerprint, hash_files, target_fingerprint};
use crate::history::{HistoryLog, HistoryRecord};
use crate::plan::DynamicSpec;
use crate::util::hash::{Fingerprint, ObjectHash};
use crate::value::Value;

/// Shared handles every job needs.
#[derive(Debug, Clone)]
pub(crate) struct JobContext {
  pub cache: Arc<CacheStore>,
  /// `None` when history is disabled for this build.
  pub history: Option<Arc<HistoryLog>>,
  pub root: PathBuf,
}

impl JobContext {
  /// Point `name` at its build and append the history record.
  fn complete(
    &self,
    name: &str,
    fingerprint: &Fingerprint,
    digest: &ObjectHash,
    kind: EntryKind,
    parents: BTreeMap<String, Fingerprint>,
    ran: bool,
  ) -> Result<(), NodeError> {
    self.cache.set_latest(name, fingerprint, digest, kind)?;
    if let Some(history) = &self.history {
      let record = HistoryRecord::new(name, fingerprint.clone(), digest.clone(), kind, parents, ran);
      history.append(&record)?;
    }
    Ok(())
  }
}

/// A finished node.
#[derive(Debug, Clone)]
pub(crate) struct Built {
  pub fingerprint: Fingerprint,
  pub value: Value,
  pub ran: bool,
  pub seconds: f64,
}

pub(crate) enum JobOutput {
  Built(Built),
  Expanded(Expansion),
}

/// Build a static target or a sub-target.
pub(crate) struct TargetJob {
  pub name: String,
  pub command: CommandRef,
  pub values: BTreeMap<String, Value>,
  /// Fingerprints of every input, recorded as history parents.
  pub deps: BTreeMap<String, Fingerprint>,
  pub files_in: Vec<PathBuf>,
  pub files_out: Vec<PathBuf>,
  /// Sub-targets arrive with their fingerprint already computed.
  pub fingerprint: Option<Fingerprint>,
}

/// Expand a dynamic target once its upstreams are built.
pub(crate) struct ExpandJob {
  pub name: String,
  pub spec: DynamicSpec,
  pub body: String,
  pub upstreams: BTreeMap<String, Value>,
  pub other_deps: BTreeMap<String, Fingerprint>,
  pub files_in: Vec<PathBuf>,
  pub policy: LengthPolicy,
  pub max_expand: Option<usize>,
}

/// Record a dynamic target once all its sub-targets are built.
pub(crate) struct FinalizeJob {
  pub name: String,
  pub spec: DynamicSpec,
  pub body: String,
  pub expansion: Expansion,
  /// Sub-target values, aligned with `expansion.subs`.
  pub values: Vec<Value>,
}

pub(crate) enum Job {
  Target(TargetJob),
  Expand(ExpandJob),
  Finalize(FinalizeJob),
}

impl Job {
  pub fn run(self, ctx: &JobContext) -> Result<JobOutput, NodeError> {
    match self {
      Job::Target(job) => job.run(ctx).map(JobOutput::Built),
      Job::Expand(job) => job.run(ctx).map(JobOutput::Expanded),
      Job::Finalize(job) => job.run(ctx).map(JobOutput::Built),
    }
  }
}

impl TargetJob {
  fn fingerprint(&self, ctx: &JobContext) -> Result<Fingerprint, NodeError> {
    if let Some(fp) = &self.fingerprint {
      return Ok(fp.clone());
    }
    let files_in = hash_files(&ctx.root, &self.files_in)?;
    let files_out = hash_files(&ctx.root, &self.files_out)?;
    Ok(target_fingerprint(&self.command.body(), &self.deps, &files_in, &files_out)?)
  }

  fn run(self, ctx: &JobContext) -> Result<Built, NodeError> {
    let fingerprint = self.fingerprint(ctx)?;

    if let Some(entry) = ctx.cache.entry(&fingerprint)?
      && entry.exists
    {
      let value = ctx.cache.get(&entry.digest)?;
      ctx.complete(&self.name, &fingerprint, &entry.digest, EntryKind::Value, self.deps, false)?;
      debug!(name = %self.name, fingerprint = %fingerprint.short(), "up to date");
      return Ok(Built {
        fingerprint,
        value,
        ran: false,
        seconds: 0.0,
      });
    }

    info!(name = %self.name, fingerprint = %fingerprint.short(), "building");

    let input = CommandInput {
      target: self.name.clone(),
      values: self.values,
      root: ctx.root.clone(),
    };
    let start = Instant::now();
    let value = catch_unwind(AssertUnwindSafe(|| self.command.run(&input))).map_err(|panic| {
      let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      CommandError::Panicked(message)
    })??;
    let seconds = start.elapsed().as_secs_f64();

    // outputs now exist; store under the fingerprint of what was written
    let fingerprint = if self.files_out.is_empty() || self.fingerprint.is_some() {
      fingerprint
    } else {
      let files_in = hash_files(&ctx.root, &self.files_in)?;
      let files_out = hash_files(&ctx.root, &self.files_out)?;
      target_fingerprint(&self.command.body(), &self.deps, &files_in, &files_out)?
    };

    let entry = ctx.cache.put(
      &fingerprint,
      &self.name,
      &value,
      EntryMeta::value(seconds, self.command.env_capture()),
    )?;
    ctx.complete(&self.name, &fingerprint, &entry.digest, EntryKind::Value, self.deps, true)?;

    info!(name = %self.name, seconds, "built");
    Ok(Built {
      fingerprint,
      value,
      ran: true,
      seconds,
    })
  }
}

impl ExpandJob {
  fn run(self, ctx: &JobContext) -> Result<Expansion, NodeError> {
    let mut other_deps = self.other_deps;
    for (path, hash) in hash_files(&ctx.root, &self.files_in)? {
      other_deps.insert(format!("file_in:{path}"), Fingerprint(hash.0));
    }

    Ok(dynamic::expand(&ExpandRequest {
      target: &self.name,
      spec: &self.spec,
      command: &self.body,
      upstreams: &self.upstreams,
      other_deps: &other_deps,
      policy: self.policy,
      max_expand: self.max_expand,
    })?)
  }
}

impl FinalizeJob {
  fn run(self, ctx: &JobContext) -> Result<Built, NodeError> {
    let subs: Vec<Fingerprint> = self.expansion.subs.iter().map(|s| s.fingerprint.clone()).collect();
    let fingerprint = dynamic_fingerprint(&self.body, &self.spec.transform, &subs)?;
    let parents: BTreeMap<String, Fingerprint> = self
      .expansion
      .subs
      .iter()
      .map(|s| (s.name.clone(), s.fingerprint.clone()))
      .collect();

    let (digest, ran) = match ctx.cache.entry(&fingerprint)? {
      Some(entry) if entry.exists => (entry.digest, false),
      _ => {
        let index = DynamicIndex::new(&self.spec, &self.expansion);
        let index = serde_json::to_value(&index).map_err(CacheError::from)?;
        let entry = ctx.cache.put(&fingerprint, &self.name, &index, EntryMeta::dynamic(0.0))?;
        (entry.digest, true)
      }
    };
    self.prune_stale_subs(ctx)?;
    ctx.complete(&self.name, &fingerprint, &digest, EntryKind::Dynamic, parents, ran)?;

    debug!(name = %self.name, subs = subs.len(), ran, "recorded dynamic target");
    Ok(Built {
      fingerprint,
      value: dynamic::aggregate(self.values),
      ran,
      seconds: 0.0,
    })
  }

  /// Drop the latest pointers of sub-targets the previous expansion made
  /// and this one no longer does, so their values become collectable.
  fn prune_stale_subs(&self, ctx: &JobContext) -> Result<(), NodeError> {
    let previous = match ctx.cache.latest(&self.name) {
      Ok(record) if record.kind == EntryKind::Dynamic => record,
      Ok(_) | Err(CacheError::NotFound(_)) => return Ok(()),
      Err(e) => return Err(e.into()),
    };
    let index: DynamicIndex = match ctx.cache.get(&previous.digest) {
      Ok(value) => match serde_json::from_value(value) {
        Ok(index) => index,
        Err(_) => return Ok(()),
      },
      Err(CacheError::NotFound(_)) => return Ok(()),
      Err(e) => return Err(e.into()),
    };

    let current: HashSet<&str> = self.expansion.subs.iter().map(|s| s.name.as_str()).collect();
    let mut pruned = 0;
    for sub in index.sub_targets.iter().filter(|s| !current.contains(s.name.as_str())) {
      if ctx.cache.remove_latest(&sub.name)?.is_some() {
        pruned += 1;
      }
    }
    if pruned > 0 {
      debug!(name = %self.name, pruned, "dropped stale sub-target pointers");
    }
    Ok(())
  }
}
