//! Implementation of the `strata graph` command.
//!
//! Text output lists nodes with their status and then every edge; JSON
//! output is the full graph info for external renderers.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};

use strata_lib::project::NodeStatus;

use super::Session;
use crate::output::{OutputFormat, print_json, symbols};

pub fn cmd_graph(session: &Session, plan_path: &Path, output: OutputFormat) -> Result<()> {
  let (project, plan, _) = session.load(plan_path)?;
  let info = project.graph_info(&plan).context("Failed to compute graph")?;

  if output.is_json() {
    return print_json(&info);
  }

  println!("Nodes:");
  for node in &info.nodes {
    let label = node.status.label();
    let status = match node.status {
      NodeStatus::UpToDate => label.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
      NodeStatus::Outdated => label.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
      NodeStatus::Imported => label.if_supports_color(Stream::Stdout, |s| s.blue()).to_string(),
      NodeStatus::Failed => label.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
    };
    println!("  {} {} ({})", symbols::INFO, node.name, status);
  }

  if !info.edges.is_empty() {
    println!();
    println!("Edges:");
    for edge in &info.edges {
      println!("  {} {} {}", edge.from, symbols::ARROW, edge.to);
    }
  }

  Ok(())
}
