use std::time::Instant;

use anyhow::{Context, Result};

use super::Session;
use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_gc(session: &Session, dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let project = session.current_project()?;

  let result = project.gc(dry_run).context("Garbage collection failed")?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Objects scanned", &result.stats.objects_scanned.to_string());
    print_stat("Objects removed", &result.stats.objects_deleted.to_string());
    print_stat("Entries removed", &result.stats.entries_deleted.to_string());
    print_stat("Space freed", &format_bytes(result.stats.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
