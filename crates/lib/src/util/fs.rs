//! Atomic file writes for persisted store state.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Write `content` to `path` atomically.
///
/// The bytes land in a temporary file in the same directory which is then
/// renamed over the destination, so readers never observe a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
  let dir = path
    .parent()
    .ok_or_else(|| io::Error::other(format!("{} has no parent directory", path.display())))?;
  fs::create_dir_all(dir)?;

  let mut temp = NamedTempFile::new_in(dir)?;
  temp.write_all(content)?;
  temp.as_file().sync_all()?;
  temp.persist(path).map_err(|e| e.error)?;
  Ok(())
}
