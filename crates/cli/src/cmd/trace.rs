use anyhow::{Context, Result};

use super::Session;
use crate::output::{OutputFormat, print_json};

pub fn cmd_trace(session: &Session, name: &str, output: OutputFormat) -> Result<()> {
  let project = session.current_project()?;
  let trace = project.trace(name).with_context(|| format!("Failed to trace '{name}'"))?;

  if output.is_json() {
    return print_json(&trace);
  }

  for entry in &trace {
    println!("  {}  {}", entry.sub_target, entry.keys);
  }
  Ok(())
}
