//! Garbage collection of unreferenced cache objects.
//!
//! An object is live while some name's latest pointer references it, or
//! while a live dynamic index lists the sub-target that produced it. Every
//! other object is deleted, then every entry whose object is gone. History
//! records that pointed at a collected object report it as gone afterwards.
//!
//! Collection holds the store's session lock exclusively, so it never runs
//! alongside a build that has written an object but not yet pointed a name
//! at it.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore, EntryKind, LockMode, ObjectInfo, StoreLock, StoreLockError};
use crate::dynamic::DynamicIndex;
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to read cache: {0}")]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GcStats {
  pub objects_scanned: usize,
  pub objects_deleted: usize,
  pub bytes_freed: u64,
  pub entries_deleted: usize,
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub stats: GcStats,
  pub deleted: Vec<ObjectHash>,
}

fn collect_live_digests(cache: &CacheStore) -> Result<HashSet<ObjectHash>, GcError> {
  let mut live = HashSet::new();
  for (name, record) in cache.names()? {
    if record.kind == EntryKind::Dynamic && cache.exists(&record.digest) {
      match serde_json::from_value::<DynamicIndex>(cache.get(&record.digest)?) {
        Ok(index) => {
          for sub in index.sub_targets {
            if let Some(entry) = cache.entry(&sub.fingerprint)? {
              live.insert(entry.digest);
            }
          }
        }
        Err(e) => warn!(name = %name, error = %e, "unreadable dynamic index"),
      }
    }
    live.insert(record.digest);
  }
  debug!(count = live.len(), "collected live digests");
  Ok(live)
}

/// Delete unreferenced objects and dangling entries. With `dry_run`,
/// report what would go without touching anything.
pub fn collect_garbage(cache: &CacheStore, dry_run: bool) -> Result<GcResult, GcError> {
  let mode = if dry_run { LockMode::Shared } else { LockMode::Exclusive };
  let _session = StoreLock::try_session(cache.root(), mode, "gc")?;

  let live = collect_live_digests(cache)?;

  let mut stats = GcStats::default();
  let mut deleted = Vec::new();
  let mut gone: HashSet<ObjectHash> = HashSet::new();

  for ObjectInfo { digest, path, size } in cache.list_objects()? {
    stats.objects_scanned += 1;
    if live.contains(&digest) {
      continue;
    }

    debug!(path = %path.display(), "removing unreferenced object");
    if dry_run {
      stats.objects_deleted += 1;
      stats.bytes_freed += size;
      gone.insert(digest.clone());
      deleted.push(digest);
      continue;
    }

    match cache.purge(&digest) {
      Ok(_) => {
        stats.objects_deleted += 1;
        stats.bytes_freed += size;
        gone.insert(digest.clone());
        deleted.push(digest);
      }
      Err(e) => {
        warn!(digest = %digest, error = %e, "failed to delete object");
      }
    }
  }

  for entry in cache.list_entries()? {
    if entry.exists && !gone.contains(&entry.digest) {
      continue;
    }
    stats.entries_deleted += 1;
    if !dry_run {
      cache.remove_entry(&entry.fingerprint)?;
    }
  }

  info!(
    objects_deleted = stats.objects_deleted,
    entries_deleted = stats.entries_deleted,
    bytes_freed = stats.bytes_freed,
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult { stats, deleted })
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use serde_json::json;
  use tempfile::TempDir;

  use super::*;
  use crate::cache::{EntryKind, EntryMeta};
  use crate::util::hash::Fingerprint;

  fn store() -> (TempDir, CacheStore) {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("store")).unwrap();
    (temp, store)
  }

  fn put_latest(store: &CacheStore, name: &str, fp: &str, value: serde_json::Value) -> ObjectHash {
    let fp = Fingerprint(fp.to_string());
    let entry = store.put(&fp, name, &value, EntryMeta::value(0.0, BTreeMap::new())).unwrap();
    store.set_latest(name, &fp, &entry.digest, EntryKind::Value).unwrap();
    entry.digest
  }

  #[test]
  fn keeps_latest_and_deletes_superseded() {
    let (_temp, store) = store();
    let old = put_latest(&store, "a", "f1", json!(1));
    let new = put_latest(&store, "a", "f2", json!(2));

    let result = collect_garbage(&store, false).unwrap();

    assert_eq!(result.stats.objects_scanned, 2);
    assert_eq!(result.deleted, vec![old.clone()]);
    assert_eq!(result.stats.entries_deleted, 1);
    assert!(!store.exists(&old));
    assert!(store.exists(&new));
    assert!(store.entry(&Fingerprint("f1".to_string())).unwrap().is_none());
  }

  #[test]
  fn dry_run_touches_nothing() {
    let (_temp, store) = store();
    let old = put_latest(&store, "a", "f1", json!(1));
    put_latest(&store, "a", "f2", json!(2));

    let result = collect_garbage(&store, true).unwrap();

    assert_eq!(result.stats.objects_deleted, 1);
    assert!(result.stats.bytes_freed > 0);
    assert!(store.exists(&old));
    assert!(store.entry(&Fingerprint("f1".to_string())).unwrap().is_some());
  }

  #[test]
  fn refuses_to_collect_during_a_build() {
    let (_temp, store) = store();
    let old = put_latest(&store, "a", "f1", json!(1));
    put_latest(&store, "a", "f2", json!(2));

    let build = StoreLock::try_session(store.root(), LockMode::Shared, "make").unwrap();
    assert!(matches!(collect_garbage(&store, false), Err(GcError::Lock(_))));
    assert!(store.exists(&old));

    // a dry run only reads, so it may run alongside
    assert_eq!(collect_garbage(&store, true).unwrap().stats.objects_deleted, 1);

    drop(build);
    assert_eq!(collect_garbage(&store, false).unwrap().deleted, vec![old]);
  }

  #[test]
  fn empty_store_is_a_no_op() {
    let (_temp, store) = store();
    let result = collect_garbage(&store, false).unwrap();
    assert_eq!(result.stats, GcStats::default());
  }
}
