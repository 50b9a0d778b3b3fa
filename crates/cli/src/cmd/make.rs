//! Implementation of the `strata make` command.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use strata_lib::dynamic::LengthPolicy;
use strata_lib::execute::{BuildConfig, BuildReport, OnFailure, TargetStatus};

use super::Session;
use crate::output::{OutputFormat, format_duration, print_info, print_json, print_stat, print_success, symbols};

/// Flags that override the plan's `[config]` table.
#[derive(Debug, Default)]
pub struct MakeOptions {
  pub workers: Option<usize>,
  pub max_expand: Option<usize>,
  pub keep_going: bool,
  pub no_history: bool,
  pub truncate: bool,
  pub targets: Vec<String>,
}

impl MakeOptions {
  fn apply(self, config: &mut BuildConfig) {
    if let Some(workers) = self.workers {
      config.workers = workers.max(1);
    }
    if self.max_expand.is_some() {
      config.max_expand = self.max_expand;
    }
    if self.keep_going {
      config.on_failure = OnFailure::Continue;
    }
    if self.no_history {
      config.history = false;
    }
    if self.truncate {
      config.length_policy = LengthPolicy::Truncate;
    }
    if !self.targets.is_empty() {
      config.targets = Some(self.targets);
    }
  }
}

#[derive(Serialize)]
struct MakeOutput<'a> {
  success: bool,
  seconds: f64,
  #[serde(flatten)]
  report: &'a BuildReport,
}

/// Build the plan and print a per-target summary.
///
/// Fails (non-zero exit) when any target did not build.
pub fn cmd_make(session: &Session, plan_path: &Path, options: MakeOptions, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let (project, plan, plan_config) = session.load(plan_path)?;

  let mut config = BuildConfig::default();
  plan_config.apply(&mut config);
  options.apply(&mut config);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(project.build(&plan, &config)).context("Build failed")?;
  let elapsed = start.elapsed();

  if output.is_json() {
    print_json(&MakeOutput {
      success: report.is_success(),
      seconds: elapsed.as_secs_f64(),
      report: &report,
    })?;
  } else {
    print_report(&report, session.verbose);
    println!();
    print_stat("Built", &report.built().len().to_string());
    print_stat("Up to date", &report.skipped().len().to_string());
    print_stat("Failed", &report.failed().len().to_string());
    if report.truncated > 0 {
      print_stat("Truncated sub-targets", &report.truncated.to_string());
    }
    print_stat("Duration", &format_duration(elapsed));
  }

  if !report.is_success() {
    bail!("{} target(s) did not build", report.failed().len());
  }
  if !output.is_json() {
    print_success("Build complete");
  }
  Ok(())
}

fn print_report(report: &BuildReport, verbose: bool) {
  let mut hidden = 0;
  for (name, target) in &report.targets {
    // sub-targets are summarized unless verbose or failed
    if target.parent.is_some() && !verbose && target.status.is_done() {
      hidden += 1;
      continue;
    }

    let symbol = match &target.status {
      TargetStatus::Built => symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
      TargetStatus::UpToDate => symbols::SKIP.if_supports_color(Stream::Stdout, |s| s.dimmed()).to_string(),
      TargetStatus::Failed { .. } | TargetStatus::DependencyFailed { .. } => {
        symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()).to_string()
      }
      TargetStatus::Cancelled => symbols::WARNING.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
    };

    let detail = match &target.status {
      TargetStatus::Built => format_duration(Duration::from_secs_f64(target.seconds)),
      TargetStatus::Failed { error } => error.clone(),
      TargetStatus::DependencyFailed { dependency } => format!("{} {}", symbols::ARROW, dependency),
      status => status.label().to_string(),
    };

    println!(
      "  {} {} {}",
      symbol,
      name,
      format!("({detail})").if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }

  if hidden > 0 {
    print_info(&format!("{hidden} sub-target(s) built or up to date"));
  }
}
