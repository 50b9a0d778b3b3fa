//! Incremental static builds.

use serde_json::json;
use strata_lib::ProjectError;
use strata_lib::execute::{BuildConfig, OnFailure, TargetStatus};
use strata_lib::graph::GraphError;
use strata_lib::plan::{Plan, TargetDef};

use super::common::{Runs, TestEnv, constant, failing, sum};

fn diamond(runs: &Runs, start: i64) -> Plan {
  Plan::new()
    .target(TargetDef::new("a", constant(json!(start), runs)))
    .target(TargetDef::new("b", sum(&["a"], 1, runs)))
    .target(TargetDef::new("c", sum(&["a"], 2, runs)))
    .target(TargetDef::new("d", sum(&["b", "c"], 0, runs)))
}

#[tokio::test]
async fn rebuild_without_changes_runs_nothing() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = diamond(&runs, 1);

  let first = env.build(&plan).await;
  assert_eq!(first.built().len(), 4);
  assert_eq!(env.value("d"), json!(5));

  let second = env.build(&plan).await;
  assert_eq!(second.skipped(), vec!["a", "b", "c", "d"]);
  assert_eq!(runs.get(), 4);
  assert_eq!(env.value("d"), json!(5));
}

#[tokio::test]
async fn reordering_the_plan_keeps_it_current() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&diamond(&runs, 1)).await;

  let reordered = Plan::new()
    .target(TargetDef::new("d", sum(&["b", "c"], 0, &runs)))
    .target(TargetDef::new("c", sum(&["a"], 2, &runs)))
    .target(TargetDef::new("b", sum(&["a"], 1, &runs)))
    .target(TargetDef::new("a", constant(json!(1), &runs)));

  let report = env.build(&reordered).await;
  assert!(report.built().is_empty());
  assert_eq!(runs.get(), 4);
}

#[tokio::test]
async fn command_change_rebuilds_only_downstream() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&diamond(&runs, 1)).await;

  let changed = Plan::new()
    .target(TargetDef::new("a", constant(json!(1), &runs)))
    .target(TargetDef::new("b", sum(&["a"], 100, &runs)))
    .target(TargetDef::new("c", sum(&["a"], 2, &runs)))
    .target(TargetDef::new("d", sum(&["b", "c"], 0, &runs)));

  let report = env.build(&changed).await;
  assert_eq!(report.built(), vec!["b", "d"]);
  assert_eq!(report.skipped(), vec!["a", "c"]);
  assert_eq!(env.value("d"), json!(104));
}

#[tokio::test]
async fn reverting_a_change_hits_the_old_cache_entry() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&diamond(&runs, 1)).await;
  env.build(&diamond(&runs, 2)).await;
  let before = runs.get();

  let report = env.build(&diamond(&runs, 1)).await;
  assert!(report.built().is_empty());
  assert_eq!(runs.get(), before);
  assert_eq!(env.value("d"), json!(5));
}

#[tokio::test]
async fn cycle_is_rejected_before_anything_runs() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = Plan::new()
    .target(TargetDef::new("x", sum(&["y"], 0, &runs)))
    .target(TargetDef::new("y", sum(&["x"], 0, &runs)));

  let err = env.project.build(&plan, &BuildConfig::default()).await.unwrap_err();
  match err {
    ProjectError::Graph(GraphError::Cycle { cycle }) => {
      assert!(cycle.contains(&"x".to_string()));
      assert!(cycle.contains(&"y".to_string()));
    }
    other => panic!("expected a cycle, got {other}"),
  }
  assert_eq!(runs.get(), 0);
}

#[tokio::test]
async fn undefined_reference_is_rejected() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = Plan::new().target(TargetDef::new("x", sum(&["nope"], 0, &runs)));

  let err = env.project.build(&plan, &BuildConfig::default()).await.unwrap_err();
  assert!(matches!(err, ProjectError::Graph(GraphError::UndefinedReference { .. })));
}

#[tokio::test]
async fn failure_is_contained_with_continue() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = Plan::new()
    .target(TargetDef::new("bad", failing("boom")))
    .target(TargetDef::new("child", sum(&["bad"], 0, &runs)))
    .target(TargetDef::new("grandchild", sum(&["child"], 0, &runs)))
    .target(TargetDef::new("fine", constant(json!(1), &runs)));
  let config = BuildConfig {
    on_failure: OnFailure::Continue,
    ..BuildConfig::default()
  };

  let report = env.build_with(&plan, config).await;

  assert!(!report.is_success());
  assert_eq!(
    report.status("grandchild"),
    Some(&TargetStatus::DependencyFailed {
      dependency: "bad".to_string()
    })
  );
  assert_eq!(report.status("fine"), Some(&TargetStatus::Built));
  assert_eq!(env.value("fine"), json!(1));
}

#[tokio::test]
async fn file_inputs_participate_in_fingerprints() {
  let env = TestEnv::new();
  let runs = Runs::default();
  std::fs::write(env.root().join("data.txt"), "one").unwrap();
  let plan = || {
    Plan::new().target(TargetDef::new("reader", constant(json!("read"), &runs)).file_in("data.txt"))
  };

  env.build(&plan()).await;
  assert!(env.build(&plan()).await.built().is_empty());

  std::fs::write(env.root().join("data.txt"), "two").unwrap();
  assert_eq!(env.build(&plan()).await.built(), vec!["reader"]);
}
