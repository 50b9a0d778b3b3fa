//! History, recovery and store maintenance.

use serde_json::json;
use strata_lib::ProjectError;
use strata_lib::cache::CacheError;
use strata_lib::execute::BuildConfig;
use strata_lib::plan::{Plan, TargetDef};

use super::common::{Runs, TestEnv, constant, sum};

fn pair(runs: &Runs, start: i64) -> Plan {
  Plan::new()
    .target(TargetDef::new("a", constant(json!(start), runs)))
    .target(TargetDef::new("b", sum(&["a"], 1, runs)))
}

#[tokio::test]
async fn every_build_appends_records_and_one_is_latest() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&pair(&runs, 1)).await;
  env.build(&pair(&runs, 1)).await;
  env.build(&pair(&runs, 7)).await;

  let records = env.project.history(Some("b"), false).unwrap();
  assert_eq!(records.len(), 3);
  assert!(records[0].ran);
  assert!(!records[1].ran);
  assert!(records[2].ran);
  assert_eq!(records.iter().filter(|r| r.latest).count(), 1);
  assert!(records[2].latest);

  let a_fp = &env.project.history(Some("a"), true).unwrap()[0].fingerprint;
  assert_eq!(records[2].parents.get("a"), Some(a_fp));
}

#[tokio::test]
async fn old_values_remain_recoverable() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&pair(&runs, 1)).await;
  env.build(&pair(&runs, 7)).await;

  let records = env.project.history(Some("b"), false).unwrap();
  assert_eq!(env.project.recover(&records[0]).unwrap(), json!(2));
  assert_eq!(env.project.recover(&records[1]).unwrap(), json!(8));
  assert_eq!(env.project.get_by_digest(&records[0].digest).unwrap(), json!(2));
}

#[tokio::test]
async fn purge_then_recover_reports_gone() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&pair(&runs, 1)).await;

  let record = env.project.history(Some("a"), true).unwrap().remove(0);
  assert!(env.project.purge(&record.digest).unwrap());
  assert!(!env.project.purge(&record.digest).unwrap());

  let err = env.project.recover(&record).unwrap_err();
  assert!(matches!(err, ProjectError::Cache(CacheError::Gone(_))));
  assert!(env.project.outdated(&pair(&runs, 1)).unwrap().contains(&"a".to_string()));
}

#[tokio::test]
async fn purged_value_is_rebuilt() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&pair(&runs, 1)).await;
  let record = env.project.history(Some("a"), true).unwrap().remove(0);
  env.project.purge(&record.digest).unwrap();

  let report = env.build(&pair(&runs, 1)).await;
  assert_eq!(report.built(), vec!["a"]);
  assert_eq!(report.skipped(), vec!["b"]);
  assert_eq!(env.value("a"), json!(1));
}

#[tokio::test]
async fn disabled_history_writes_nothing() {
  let env = TestEnv::new();
  let runs = Runs::default();
  let config = BuildConfig {
    history: false,
    ..BuildConfig::default()
  };

  env.build_with(&pair(&runs, 1), config).await;

  assert!(env.project.history(None, false).unwrap().is_empty());
  assert_eq!(env.value("b"), json!(2));
}

#[tokio::test]
async fn clean_all_then_gc_empties_the_store() {
  let env = TestEnv::new();
  let runs = Runs::default();
  env.build(&pair(&runs, 1)).await;

  let mut cleaned = env.project.clean(&[]).unwrap();
  cleaned.sort();
  assert_eq!(cleaned, vec!["a", "b"]);

  let result = env.project.gc(false).unwrap();
  assert_eq!(result.stats.objects_deleted, 2);
  assert!(env.project.cache().list_objects().unwrap().is_empty());
  assert!(env.project.history(None, false).unwrap().iter().all(|r| !r.exists));
}
