use std::path::Path;

use anyhow::{Context, Result};

use super::Session;
use crate::output::{OutputFormat, print_json, print_success, symbols};

pub fn cmd_outdated(session: &Session, plan_path: &Path, output: OutputFormat) -> Result<()> {
  let (project, plan, _) = session.load(plan_path)?;
  let outdated = project.outdated(&plan).context("Failed to compute outdated targets")?;

  if output.is_json() {
    print_json(&outdated)?;
  } else if outdated.is_empty() {
    print_success("Everything is up to date");
  } else {
    for name in &outdated {
      println!("  {} {}", symbols::INFO, name);
    }
  }

  Ok(())
}
