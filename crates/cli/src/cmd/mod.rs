mod clean;
mod gc;
mod get;
mod graph;
mod history;
mod make;
mod outdated;
mod purge;
mod trace;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use strata_lib::Project;
use strata_lib::plan::Plan;
use strata_lib::plan::file::{PlanConfig, load_plan};
use tracing::debug;

pub use clean::cmd_clean;
pub use gc::cmd_gc;
pub use get::cmd_get;
pub use graph::cmd_graph;
pub use history::cmd_history;
pub use make::{MakeOptions, cmd_make};
pub use outdated::cmd_outdated;
pub use purge::cmd_purge;
pub use trace::cmd_trace;

/// Global options shared by every command.
pub struct Session {
  pub store: Option<PathBuf>,
  pub verbose: bool,
}

impl Session {
  /// Open the project rooted at `root`.
  pub fn project(&self, root: &Path) -> Result<Project> {
    let project = match &self.store {
      Some(store) => Project::with_store(root, store),
      None => Project::open(root),
    }
    .with_context(|| format!("Failed to open store for {}", root.display()))?;
    debug!(store = %project.store().display(), "using store");
    Ok(project)
  }

  /// Open the project in the current directory, for commands without a plan.
  pub fn current_project(&self) -> Result<Project> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    self.project(&cwd)
  }

  /// Load a plan file and open the project rooted at its directory.
  pub fn load(&self, plan_path: &Path) -> Result<(Project, Plan, PlanConfig)> {
    if !plan_path.exists() {
      anyhow::bail!("Plan file not found: {}", plan_path.display());
    }
    let (plan, config) = load_plan(plan_path).with_context(|| format!("Failed to load {}", plan_path.display()))?;

    let dir = match plan_path.parent() {
      Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
      _ => PathBuf::from("."),
    };
    let root = dunce::canonicalize(&dir).with_context(|| format!("Failed to resolve {}", dir.display()))?;

    Ok((self.project(&root)?, plan, config))
  }
}
