use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use strata_lib::history::HistoryRecord;

use super::Session;
use crate::output::{OutputFormat, format_timestamp, print_info, print_json, truncate_hash};

#[derive(Serialize)]
struct RecordOutput<'a> {
  #[serde(flatten)]
  record: &'a HistoryRecord,
  latest: bool,
  exists: bool,
}

pub fn cmd_history(session: &Session, name: Option<&str>, latest: bool, output: OutputFormat) -> Result<()> {
  let project = session.current_project()?;
  let records = project.history(name, latest).context("Failed to read history")?;

  if output.is_json() {
    let rows: Vec<_> = records
      .iter()
      .map(|record| RecordOutput {
        record,
        latest: record.latest,
        exists: record.exists,
      })
      .collect();
    return print_json(&rows);
  }

  if records.is_empty() {
    print_info("No history recorded yet.");
    return Ok(());
  }

  for record in &records {
    let mut flags = Vec::new();
    if record.latest {
      flags.push("latest");
    }
    if !record.exists {
      flags.push("gone");
    }
    let action = if record.ran { "built" } else { "up to date" };

    println!(
      "{}  {}  {}  {}  {}{}",
      format_timestamp(record.built_at_unix).if_supports_color(Stream::Stdout, |s| s.dimmed()),
      record.name,
      truncate_hash(&record.fingerprint.0),
      truncate_hash(&record.digest.0),
      action,
      if flags.is_empty() {
        String::new()
      } else {
        format!(" [{}]", flags.join(", "))
      }
    );
  }

  Ok(())
}
