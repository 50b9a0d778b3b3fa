//! Dynamic targets: map, cross and group expansion.

use serde_json::json;
use strata_lib::execute::{BuildConfig, TargetStatus};
use strata_lib::plan::{DynamicSpec, Plan, TargetDef, Transform};

use super::common::{Runs, TestEnv, constant, subs_of, sum};

fn mapped(runs: &Runs, xs: serde_json::Value) -> Plan {
  Plan::new()
    .target(TargetDef::new("xs", constant(xs, runs)))
    .target(TargetDef::new("ys", sum(&["xs"], 10, runs)).dynamic(Transform::map(["xs"])))
}

#[tokio::test]
async fn appending_an_element_builds_one_new_sub_target() {
  let env = TestEnv::new();
  let runs = Runs::default();

  let first = env.build(&mapped(&runs, json!([1]))).await;
  assert_eq!(subs_of(&first, "ys").len(), 1);
  assert_eq!(env.value("ys"), json!([11]));

  let second = env.build(&mapped(&runs, json!([1, 2]))).await;
  let subs = subs_of(&second, "ys");
  assert_eq!(subs.len(), 2);

  let built: Vec<_> = subs
    .iter()
    .filter(|name| second.status(name) == Some(&TargetStatus::Built))
    .collect();
  assert_eq!(built.len(), 1);
  assert_eq!(second.status("ys"), Some(&TargetStatus::Built));
  assert_eq!(env.value("ys"), json!([11, 12]));
}

#[tokio::test]
async fn unchanged_dynamic_target_is_skipped_entirely() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = mapped(&runs, json!([1, 2, 3]));

  env.build(&plan).await;
  let runs_after_first = runs.get();
  let report = env.build(&plan).await;

  assert!(report.built().is_empty());
  assert_eq!(runs.get(), runs_after_first);
  assert!(env.project.outdated(&plan).unwrap().is_empty());
}

#[tokio::test]
async fn identical_elements_share_a_sub_target() {
  let env = TestEnv::new();
  let runs = Runs::default();

  let report = env.build(&mapped(&runs, json!([5, 5, 5]))).await;

  assert_eq!(subs_of(&report, "ys").len(), 1);
  assert_eq!(env.value("ys"), json!([15, 15, 15]));
}

#[tokio::test]
async fn cross_builds_every_combination_row_major() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = Plan::new()
    .target(TargetDef::new("xs", constant(json!([1, 2]), &runs)))
    .target(TargetDef::new("ys", constant(json!([10, 20, 30]), &runs)))
    .target(TargetDef::new("pairs", sum(&["xs", "ys"], 0, &runs)).dynamic(Transform::cross(["xs", "ys"])));

  let report = env.build(&plan).await;

  assert!(report.is_success());
  assert_eq!(subs_of(&report, "pairs").len(), 6);
  assert_eq!(env.value("pairs"), json!([11, 21, 31, 12, 22, 32]));
}

#[tokio::test]
async fn map_over_unequal_lengths_fails_unless_truncating() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let plan = Plan::new()
    .target(TargetDef::new("xs", constant(json!([1, 2, 3]), &runs)))
    .target(TargetDef::new("ys", constant(json!([10, 20]), &runs)))
    .target(TargetDef::new("zs", sum(&["xs", "ys"], 0, &runs)).dynamic(Transform::map(["xs", "ys"])));

  let strict = env.build(&plan).await;
  assert!(matches!(strict.status("zs"), Some(TargetStatus::Failed { .. })));

  let config = BuildConfig {
    length_policy: strata_lib::dynamic::LengthPolicy::Truncate,
    ..BuildConfig::default()
  };
  let truncated = env.build_with(&plan, config).await;
  assert!(truncated.is_success());
  assert_eq!(env.value("zs"), json!([11, 22]));
}

#[tokio::test]
async fn group_with_trace_records_keys() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let count = strata_lib::command::FnCommand::new("count members", |ctx| {
    Ok(json!(ctx.get("words")?.as_array().map_or(0, |a| a.len())))
  });
  let plan = Plan::new()
    .target(TargetDef::new("words", constant(json!(["a", "b", "c", "d", "e"]), &runs)))
    .target(TargetDef::new("kinds", constant(json!(["v", "c", "c", "c", "v"]), &runs)))
    .target(TargetDef::new("counts", count).dynamic(DynamicSpec::new(Transform::group("words", "kinds")).traced()));

  let report = env.build(&plan).await;
  assert!(report.is_success());
  assert_eq!(env.value("counts"), json!([2, 3]));

  let trace = env.project.trace("counts").unwrap();
  let keys: Vec<_> = trace.iter().map(|t| t.keys.clone()).collect();
  assert_eq!(keys, vec![json!({"kinds": "v"}), json!({"kinds": "c"})]);
  assert!(trace.iter().all(|t| t.sub_target.starts_with("counts_")));
}

#[tokio::test]
async fn max_expand_caps_sub_targets() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let config = BuildConfig {
    max_expand: Some(2),
    ..BuildConfig::default()
  };

  let report = env.build_with(&mapped(&runs, json!([1, 2, 3, 4, 5])), config).await;

  assert_eq!(report.truncated, 3);
  assert_eq!(subs_of(&report, "ys").len(), 2);
  assert_eq!(env.value("ys"), json!([11, 12]));

  let history = env.project.history(None, false).unwrap();
  let sub_records = history.iter().filter(|r| r.name.starts_with("ys_")).count();
  assert_eq!(sub_records, 2);
}

#[tokio::test]
async fn empty_upstream_yields_empty_aggregate() {
  let env = TestEnv::new();
  let runs = Runs::default();

  let report = env.build(&mapped(&runs, json!([]))).await;

  assert!(report.is_success());
  assert!(subs_of(&report, "ys").is_empty());
  assert_eq!(env.value("ys"), json!([]));
}
