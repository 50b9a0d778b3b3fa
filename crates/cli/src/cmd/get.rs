use anyhow::{Context, Result, bail};

use strata_lib::util::hash::ObjectHash;

use super::Session;
use crate::output::print_json;

pub fn cmd_get(session: &Session, name: Option<&str>, digest: Option<&str>) -> Result<()> {
  let project = session.current_project()?;

  let value = match (name, digest) {
    (_, Some(digest)) => project
      .get_by_digest(&ObjectHash::parse(digest)?)
      .with_context(|| format!("No value for digest {digest}"))?,
    (Some(name), None) => project
      .get_by_name(name)
      .with_context(|| format!("No value for '{name}'"))?,
    (None, None) => bail!("Give a target name or --digest"),
  };

  print_json(&value)
}
