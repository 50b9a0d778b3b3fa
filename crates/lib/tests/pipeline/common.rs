//! Shared helpers for pipeline tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use strata_lib::Project;
use strata_lib::command::{CommandError, FnCommand};
use strata_lib::execute::{BuildConfig, BuildReport};
use strata_lib::plan::Plan;
use tempfile::TempDir;

/// Isolated project with its own root and store.
pub struct TestEnv {
  pub temp: TempDir,
  pub project: Project,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let project = Project::with_store(temp.path(), temp.path().join(".strata")).unwrap();
    Self { temp, project }
  }

  pub fn root(&self) -> PathBuf {
    self.temp.path().to_path_buf()
  }

  pub async fn build(&self, plan: &Plan) -> BuildReport {
    self.build_with(plan, BuildConfig::default()).await
  }

  pub async fn build_with(&self, plan: &Plan, config: BuildConfig) -> BuildReport {
    self.project.build(plan, &config).await.unwrap()
  }

  pub fn value(&self, name: &str) -> Value {
    self.project.get_by_name(name).unwrap()
  }
}

/// Counts command runs across a test.
#[derive(Debug, Clone, Default)]
pub struct Runs(Arc<AtomicUsize>);

impl Runs {
  pub fn get(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }

  fn bump(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }
}

pub fn constant(value: Value, runs: &Runs) -> FnCommand {
  let runs = runs.clone();
  FnCommand::new(format!("constant({value})"), move |_| {
    runs.bump();
    Ok(value.clone())
  })
}

/// `sum(inputs) + n` over the named numeric inputs.
pub fn sum(inputs: &[&str], n: i64, runs: &Runs) -> FnCommand {
  let runs = runs.clone();
  let names: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
  FnCommand::new(format!("sum({}) + {n}", names.join(",")), {
    let names = names.clone();
    move |ctx| {
      runs.bump();
      let mut total = n;
      for name in &names {
        total += ctx
          .get(name)?
          .as_i64()
          .ok_or_else(|| CommandError::failed(format!("{name} is not an integer")))?;
      }
      Ok(json!(total))
    }
  })
  .reads(names)
}

pub fn failing(message: &str) -> FnCommand {
  let message = message.to_string();
  FnCommand::new(format!("fail({message})"), move |_| Err(CommandError::failed(message.clone())))
}

/// Names of the sub-targets of `parent` in a report.
pub fn subs_of<'a>(report: &'a BuildReport, parent: &str) -> Vec<&'a str> {
  report
    .targets
    .iter()
    .filter(|(_, t)| t.parent.as_deref() == Some(parent))
    .map(|(name, _)| name.as_str())
    .collect()
}
