//! Plans loaded from `strata.toml` with shell commands.

use serde_json::json;
use strata_lib::execute::{BuildConfig, OnFailure, TargetStatus};
use strata_lib::plan::file::{PLAN_FILE_NAME, load_plan};

use super::common::TestEnv;

const PLAN: &str = r#"
[config]
on_failure = "continue"

[imports]
offset = 100

[[target]]
name = "numbers"
command = "echo '[1, 2, 3]'"

[[target]]
name = "squares"
command = "echo $(( $${numbers} * $${numbers} ))"
dynamic = { map = ["numbers"] }

[[target]]
name = "total"
command = "echo '$${squares}' | tr -d '[] ' | tr ',' '\n' | awk -v o=$${offset} '{ s += $1 } END { print s + o }'"
"#;

fn write_plan(env: &TestEnv, text: &str) -> std::path::PathBuf {
  let path = env.root().join(PLAN_FILE_NAME);
  std::fs::write(&path, text).unwrap();
  path
}

#[tokio::test]
async fn shell_plan_builds_and_rebuilds_incrementally() {
  let env = TestEnv::new();
  let (plan, plan_config) = load_plan(&write_plan(&env, PLAN)).unwrap();
  let mut config = BuildConfig::default();
  plan_config.apply(&mut config);
  assert_eq!(config.on_failure, OnFailure::Continue);

  let report = env.build_with(&plan, config.clone()).await;
  assert!(report.is_success(), "{report:?}");
  assert_eq!(env.value("squares"), json!([1, 4, 9]));
  assert_eq!(env.value("total"), json!(114));

  let again = env.build_with(&plan, config).await;
  assert!(again.built().is_empty());
}

#[tokio::test]
async fn file_output_is_tracked() {
  let env = TestEnv::new();
  let text = r#"
[[target]]
name = "writer"
command = "echo hello > $${file_out:out.txt} && echo done"
"#;
  let (plan, _) = load_plan(&write_plan(&env, text)).unwrap();

  assert_eq!(env.build(&plan).await.built(), vec!["writer"]);
  assert_eq!(std::fs::read_to_string(env.root().join("out.txt")).unwrap(), "hello\n");
  assert!(env.build(&plan).await.built().is_empty());

  std::fs::write(env.root().join("out.txt"), "tampered").unwrap();
  assert_eq!(env.build(&plan).await.built(), vec!["writer"]);
}

#[tokio::test]
async fn failing_shell_command_reports_exit() {
  let env = TestEnv::new();
  let text = r#"
[[target]]
name = "broken"
command = "echo oops >&2; exit 3"
"#;
  let (plan, _) = load_plan(&write_plan(&env, text)).unwrap();

  let report = env.build(&plan).await;
  match report.status("broken") {
    Some(TargetStatus::Failed { error }) => {
      assert!(error.contains("3"), "{error}");
      assert!(error.contains("oops"), "{error}");
    }
    other => panic!("unexpected status: {other:?}"),
  }
}
