//! Build execution.
//!
//! [`build`] turns a validated [`Graph`] into a [`BuildReport`]:
//! - dependency-ordered, parallel dispatch bounded by `workers`
//! - cache checks by fingerprint, skipping up-to-date targets
//! - expansion of dynamic targets into sub-targets at run time
//! - failure containment per [`OnFailure`]

mod job;
mod scheduler;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheStore, LockMode, StoreLock};
use crate::graph::Graph;
use crate::history::HistoryLog;
use crate::plan::Plan;

use job::JobContext;
use scheduler::Scheduler;

pub use types::{BuildConfig, BuildError, BuildReport, NodeError, OnFailure, TargetReport, TargetStatus};

/// Build a plan against a cache.
///
/// `root` is the directory commands run in and file markers resolve
/// against. Node failures land in the report; only problems outside any
/// single node return `Err`. The store's session lock is held shared for
/// the whole build, so garbage collection cannot run underneath it.
pub async fn build(
  plan: &Plan,
  graph: &Graph,
  cache: Arc<CacheStore>,
  root: &Path,
  config: &BuildConfig,
) -> Result<BuildReport, BuildError> {
  let _session = StoreLock::try_session(cache.root(), LockMode::Shared, "make")?;
  let history = config.history.then(|| Arc::new(HistoryLog::new(cache.root())));
  let ctx = JobContext {
    cache,
    history,
    root: root.to_path_buf(),
  };

  let (targets, truncated) = Scheduler::new(plan, graph, config, ctx)?.run().await?;
  let report = BuildReport { targets, truncated };

  info!(
    built = report.built().len(),
    skipped = report.skipped().len(),
    failed = report.failed().len(),
    truncated = report.truncated,
    "build finished"
  );

  Ok(report)
}
