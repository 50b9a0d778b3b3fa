//! The append-only history log.
//!
//! One JSON line per completed build of a target, in `history.jsonl` inside
//! the store. Records are never rewritten. Whether a record is the latest for
//! its name, and whether its value is still recoverable, are derived when the
//! log is queried.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::cache::{CacheError, CacheStore, EntryKind, LockMode, StoreLock, StoreLockError};
use crate::util::hash::{Fingerprint, ObjectHash};

const HISTORY_FILENAME: &str = "history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
  #[error("failed to read history log {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to append to history log {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize history record: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

/// One build of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub name: String,
  pub fingerprint: Fingerprint,
  pub digest: ObjectHash,
  /// Whether `digest` names the value itself or a dynamic target's index.
  #[serde(default)]
  pub kind: EntryKind,
  /// Fingerprints of the dependencies this build used.
  #[serde(default)]
  pub parents: BTreeMap<String, Fingerprint>,
  pub built_at_unix: u64,
  /// False when the cache was already current and the command was skipped.
  pub ran: bool,
  #[serde(skip)]
  pub latest: bool,
  #[serde(skip)]
  pub exists: bool,
}

impl HistoryRecord {
  pub fn new(
    name: impl Into<String>,
    fingerprint: Fingerprint,
    digest: ObjectHash,
    kind: EntryKind,
    parents: BTreeMap<String, Fingerprint>,
    ran: bool,
  ) -> Self {
    Self {
      name: name.into(),
      fingerprint,
      digest,
      kind,
      parents,
      built_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      ran,
      latest: false,
      exists: false,
    }
  }
}

/// Handle on a store's history log.
#[derive(Debug)]
pub struct HistoryLog {
  store: PathBuf,
  path: PathBuf,
  write: Mutex<()>,
}

impl HistoryLog {
  pub fn new(store: &Path) -> Self {
    Self {
      store: store.to_path_buf(),
      path: store.join(HISTORY_FILENAME),
      write: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Append one record as a single line.
  pub fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
    let _lock = StoreLock::acquire(&self.store, LockMode::Exclusive, "history")?;

    let write_err = |source| HistoryError::Write {
      path: self.path.clone(),
      source,
    };
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .map_err(write_err)?;
    file.write_all(&line).map_err(write_err)?;

    trace!(name = %record.name, ran = record.ran, "appended history record");
    Ok(())
  }

  /// Every record, oldest first, without derived flags.
  pub fn read_all(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => {
        return Err(HistoryError::Read {
          path: self.path.clone(),
          source,
        });
      }
    };

    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str::<HistoryRecord>(line) {
        Ok(record) => records.push(record),
        // a torn final line from a crashed writer must not hide the rest
        Err(e) => warn!(line = line_no + 1, error = %e, "skipping unreadable history line"),
      }
    }
    Ok(records)
  }

  /// Records for `name` (or all names), oldest first, with `latest` and
  /// `exists` filled in from `cache`.
  ///
  /// A record is latest when it is the newest record for its name and the
  /// name's latest pointer still refers to its fingerprint. With
  /// `latest_only`, at most one record per name is returned.
  pub fn query(&self, name: Option<&str>, latest_only: bool, cache: &CacheStore) -> Result<Vec<HistoryRecord>, HistoryError> {
    let mut records: Vec<HistoryRecord> = self
      .read_all()?
      .into_iter()
      .filter(|r| name.is_none_or(|n| r.name == n))
      .collect();

    let names = cache.names()?;
    let mut newest: HashMap<&str, usize> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
      newest.insert(record.name.as_str(), idx);
    }
    let latest_idx: Vec<usize> = newest
      .into_iter()
      .filter(|(n, idx)| names.get(*n).is_some_and(|rec| rec.fingerprint == records[*idx].fingerprint))
      .map(|(_, idx)| idx)
      .collect();

    for idx in latest_idx {
      records[idx].latest = true;
    }
    for record in &mut records {
      record.exists = cache.exists(&record.digest);
    }

    if latest_only {
      records.retain(|r| r.latest);
    }
    Ok(records)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryMeta;
  use serde_json::json;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  fn setup() -> (TempDir, CacheStore, HistoryLog) {
    let temp = TempDir::new().unwrap();
    let cache = CacheStore::open(temp.path()).unwrap();
    let log = HistoryLog::new(temp.path());
    (temp, cache, log)
  }

  fn build(cache: &CacheStore, log: &HistoryLog, name: &str, fp: &str, value: serde_json::Value) -> HistoryRecord {
    let fingerprint = Fingerprint(fp.to_string());
    let entry = cache
      .put(&fingerprint, name, &value, EntryMeta::value(0.0, BTreeMap::new()))
      .unwrap();
    cache.set_latest(name, &fingerprint, &entry.digest, EntryKind::Value).unwrap();
    let record = HistoryRecord::new(name, fingerprint, entry.digest, EntryKind::Value, BTreeMap::new(), true);
    log.append(&record).unwrap();
    record
  }

  #[test]
  fn empty_log_has_no_records() {
    let (_temp, cache, log) = setup();
    assert!(log.query(None, false, &cache).unwrap().is_empty());
  }

  #[test]
  fn records_are_ordered_and_latest_marked() {
    let (_temp, cache, log) = setup();
    build(&cache, &log, "a", "f1", json!(1));
    build(&cache, &log, "b", "g1", json!("x"));
    build(&cache, &log, "a", "f2", json!(2));

    let records = log.query(Some("a"), false, &cache).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].fingerprint.0, "f1");
    assert!(!records[0].latest);
    assert!(records[1].latest);
    assert!(records.iter().all(|r| r.exists));

    let latest = log.query(Some("a"), true, &cache).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].fingerprint.0, "f2");

    assert_eq!(log.query(None, true, &cache).unwrap().len(), 2);
  }

  #[test]
  fn purged_value_reports_not_existing() {
    let (_temp, cache, log) = setup();
    let old = build(&cache, &log, "a", "f1", json!(1));
    build(&cache, &log, "a", "f2", json!(2));
    cache.purge(&old.digest).unwrap();

    let records = log.query(Some("a"), false, &cache).unwrap();
    assert!(!records[0].exists);
    assert!(records[1].exists);
  }

  #[test]
  fn cleaned_name_has_no_latest() {
    let (_temp, cache, log) = setup();
    build(&cache, &log, "a", "f1", json!(1));
    cache.remove_latest("a").unwrap();

    assert!(log.query(Some("a"), true, &cache).unwrap().is_empty());
    assert_eq!(log.query(Some("a"), false, &cache).unwrap().len(), 1);
  }

  #[test]
  #[traced_test]
  fn torn_line_is_skipped() {
    let (_temp, cache, log) = setup();
    build(&cache, &log, "a", "f1", json!(1));
    let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
    file.write_all(b"{\"name\": \"a\", \"finger").unwrap();

    assert_eq!(log.read_all().unwrap().len(), 1);
    assert!(logs_contain("skipping unreadable history line"));
  }
}
