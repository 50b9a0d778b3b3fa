use anyhow::{Context, Result};

use strata_lib::util::hash::ObjectHash;

use super::Session;
use crate::output::{confirm, print_info, print_success, print_warning};

pub fn cmd_purge(session: &Session, digest: &str, yes: bool) -> Result<()> {
  let project = session.current_project()?;
  let digest = ObjectHash::parse(digest)?;

  if !confirm(&format!("Purge value {digest}?"), yes)? {
    print_info("Aborted.");
    return Ok(());
  }

  let removed = project
    .purge(&digest)
    .with_context(|| format!("Failed to purge {digest}"))?;
  if removed {
    print_success(&format!("Purged {digest}"));
  } else {
    print_warning(&format!("No stored value {digest}"));
  }
  Ok(())
}
