use anyhow::{Context, Result};

use super::Session;
use crate::output::{confirm, print_info, print_success};

pub fn cmd_clean(session: &Session, names: &[String], yes: bool) -> Result<()> {
  let project = session.current_project()?;

  if names.is_empty() && !confirm("Clean every target?", yes)? {
    print_info("Aborted.");
    return Ok(());
  }

  let cleaned = project.clean(names).context("Failed to clean")?;
  if cleaned.is_empty() {
    print_info("Nothing to clean.");
  } else {
    print_success(&format!("Cleaned {} target(s)", cleaned.len()));
    if session.verbose {
      for name in &cleaned {
        println!("  {name}");
      }
    }
  }
  Ok(())
}
