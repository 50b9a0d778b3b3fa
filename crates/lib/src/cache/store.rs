//! Cache store: values by digest, entries by fingerprint, latest by name.
//!
//! Values are stored once per distinct digest no matter how many targets or
//! builds produced them. A [`CacheEntry`] ties one fingerprint to the digest
//! of the value it produced. The name index maps each target name to its
//! latest entry.
//!
//! All writes are atomic (temp file + rename) and serialized by an
//! in-process mutex plus the store's advisory file lock.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use super::lock::{LockMode, StoreLock, StoreLockError};
use crate::util::fs::write_atomic;
use crate::util::hash::{Fingerprint, InvalidDigest, ObjectHash};
use crate::value::{Value, canonical_bytes, value_digest};

const OBJECTS_DIR: &str = "objects";
const ENTRIES_DIR: &str = "entries";
const NAMES_FILENAME: &str = "names.json";
const FAILURES_FILENAME: &str = "failures.json";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("value {0} is gone (purged or garbage-collected)")]
  Gone(String),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error(transparent)]
  InvalidDigest(#[from] InvalidDigest),

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

/// What a cache entry's object holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
  /// The target's value.
  #[default]
  Value,
  /// A dynamic target's sub-target index.
  Dynamic,
}

/// Metadata for one build of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub fingerprint: Fingerprint,
  pub name: String,
  pub digest: ObjectHash,
  pub kind: EntryKind,
  pub built_at_unix: u64,
  /// Wall time the command took.
  pub seconds: f64,
  /// Runtime environment captured from the command.
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Whether the object is still in the store; computed on load.
  #[serde(skip)]
  pub exists: bool,
}

/// Caller-supplied part of a new entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
  pub kind: EntryKind,
  pub seconds: f64,
  pub env: BTreeMap<String, String>,
}

impl EntryMeta {
  pub fn value(seconds: f64, env: BTreeMap<String, String>) -> Self {
    Self {
      kind: EntryKind::Value,
      seconds,
      env,
    }
  }

  pub fn dynamic(seconds: f64) -> Self {
    Self {
      kind: EntryKind::Dynamic,
      seconds,
      env: BTreeMap::new(),
    }
  }
}

/// A name's latest build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
  pub fingerprint: Fingerprint,
  pub digest: ObjectHash,
  #[serde(default)]
  pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
  pub digest: ObjectHash,
  pub path: PathBuf,
  pub size: u64,
}

/// Handle on one store directory.
#[derive(Debug)]
pub struct CacheStore {
  root: PathBuf,
  write: Mutex<()>,
}

impl CacheStore {
  /// Open (creating if needed) the store at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let root = root.into();
    for dir in [root.join(OBJECTS_DIR), root.join(ENTRIES_DIR)] {
      fs::create_dir_all(&dir).map_err(|source| CacheError::Write { path: dir.clone(), source })?;
    }
    debug!(store = %root.display(), "opened cache store");
    Ok(Self {
      root,
      write: Mutex::new(()),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Digests arrive from users, so they are checked before touching a path.
  fn object_path(&self, digest: &ObjectHash) -> Result<PathBuf, InvalidDigest> {
    if !digest.is_valid() {
      return Err(InvalidDigest(digest.0.clone()));
    }
    let prefix = &digest.0[..2];
    Ok(self.root.join(OBJECTS_DIR).join(prefix).join(format!("{}.json", digest.0)))
  }

  fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.root.join(ENTRIES_DIR).join(format!("{}.json", fingerprint.0))
  }

  fn names_path(&self) -> PathBuf {
    self.root.join(NAMES_FILENAME)
  }

  fn failures_path(&self) -> PathBuf {
    self.root.join(FAILURES_FILENAME)
  }

  /// Run `f` holding both the in-process and the cross-process write lock.
  pub(crate) fn with_write_lock<T>(&self, op: &str, f: impl FnOnce() -> Result<T, CacheError>) -> Result<T, CacheError> {
    let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
    let _lock = StoreLock::acquire(&self.root, LockMode::Exclusive, op)?;
    f()
  }

  fn write_file(path: &Path, content: &[u8]) -> Result<(), CacheError> {
    write_atomic(path, content).map_err(|source| CacheError::Write {
      path: path.to_path_buf(),
      source,
    })
  }

  fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CacheError> {
    let bytes = match fs::read(path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(CacheError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|source| CacheError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Store `value` once under its digest.
  pub fn put_object(&self, value: &Value) -> Result<ObjectHash, CacheError> {
    let digest = value_digest(value);
    let path = self.object_path(&digest)?;
    if path.exists() {
      trace!(digest = %digest, "object already stored");
      return Ok(digest);
    }
    self.with_write_lock("put", || Self::write_file(&path, &canonical_bytes(value)))?;
    Ok(digest)
  }

  /// Store `value` and record an entry for `fingerprint`.
  pub fn put(&self, fingerprint: &Fingerprint, name: &str, value: &Value, meta: EntryMeta) -> Result<CacheEntry, CacheError> {
    let digest = self.put_object(value)?;
    let entry = CacheEntry {
      fingerprint: fingerprint.clone(),
      name: name.to_string(),
      digest,
      kind: meta.kind,
      built_at_unix: now_unix(),
      seconds: meta.seconds,
      env: meta.env,
      exists: true,
    };

    let content = serde_json::to_vec_pretty(&entry)?;
    let path = self.entry_path(fingerprint);
    self.with_write_lock("put", || Self::write_file(&path, &content))?;

    debug!(name = %name, fingerprint = %fingerprint.short(), digest = %entry.digest, "cached value");
    Ok(entry)
  }

  /// Load a value by digest.
  pub fn get(&self, digest: &ObjectHash) -> Result<Value, CacheError> {
    Self::read_json(&self.object_path(digest)?)?.ok_or_else(|| CacheError::NotFound(digest.0.clone()))
  }

  /// Whether the object for `digest` is physically present.
  pub fn exists(&self, digest: &ObjectHash) -> bool {
    self.object_path(digest).is_ok_and(|path| path.is_file())
  }

  /// The entry for `fingerprint`, if one was ever written and not removed.
  pub fn entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let entry: Option<CacheEntry> = Self::read_json(&self.entry_path(fingerprint))?;
    Ok(entry.map(|mut e| {
      e.exists = self.exists(&e.digest);
      e
    }))
  }

  /// True when an entry for `fingerprint` exists and its value is present.
  pub fn is_current(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    Ok(self.entry(fingerprint)?.is_some_and(|e| e.exists))
  }

  /// Negation of [`CacheStore::is_current`]: a cache miss for this exact fingerprint.
  pub fn is_outdated(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    Ok(!self.is_current(fingerprint)?)
  }

  pub fn names(&self) -> Result<BTreeMap<String, NameRecord>, CacheError> {
    Ok(Self::read_json(&self.names_path())?.unwrap_or_default())
  }

  /// The latest build of `name`.
  pub fn latest(&self, name: &str) -> Result<NameRecord, CacheError> {
    self
      .names()?
      .remove(name)
      .ok_or_else(|| CacheError::NotFound(name.to_string()))
  }

  pub fn set_latest(
    &self,
    name: &str,
    fingerprint: &Fingerprint,
    digest: &ObjectHash,
    kind: EntryKind,
  ) -> Result<(), CacheError> {
    let path = self.names_path();
    self.with_write_lock("set-latest", || {
      let mut names: BTreeMap<String, NameRecord> = Self::read_json(&path)?.unwrap_or_default();
      names.insert(
        name.to_string(),
        NameRecord {
          fingerprint: fingerprint.clone(),
          digest: digest.clone(),
          kind,
        },
      );
      Self::write_file(&path, &serde_json::to_vec_pretty(&names)?)
    })
  }

  /// Drop `name` from the latest index. Returns the removed record.
  pub fn remove_latest(&self, name: &str) -> Result<Option<NameRecord>, CacheError> {
    let path = self.names_path();
    self.with_write_lock("remove-latest", || {
      let mut names: BTreeMap<String, NameRecord> = Self::read_json(&path)?.unwrap_or_default();
      let removed = names.remove(name);
      if removed.is_some() {
        Self::write_file(&path, &serde_json::to_vec_pretty(&names)?)?;
      }
      Ok(removed)
    })
  }

  /// Delete the entry for `fingerprint`; the object stays.
  pub fn remove_entry(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    let path = self.entry_path(fingerprint);
    self.with_write_lock("remove-entry", || remove_file(&path))
  }

  /// Delete the object for `digest`. Later lookups report it gone.
  pub fn purge(&self, digest: &ObjectHash) -> Result<bool, CacheError> {
    let path = self.object_path(digest)?;
    let removed = self.with_write_lock("purge", || remove_file(&path))?;
    if removed {
      debug!(digest = %digest, "purged object");
    }
    Ok(removed)
  }

  /// Targets that failed in the most recent build, with their errors.
  pub fn failures(&self) -> Result<BTreeMap<String, String>, CacheError> {
    Ok(Self::read_json(&self.failures_path())?.unwrap_or_default())
  }

  /// Record the outcome of a build: names in `failed` are marked failed,
  /// names in `succeeded` are cleared. Other names keep their mark.
  pub fn record_failures<'a>(
    &self,
    failed: impl IntoIterator<Item = (&'a str, &'a str)>,
    succeeded: impl IntoIterator<Item = &'a str>,
  ) -> Result<(), CacheError> {
    let path = self.failures_path();
    self.with_write_lock("record-failures", || {
      let mut failures: BTreeMap<String, String> = Self::read_json(&path)?.unwrap_or_default();
      for name in succeeded {
        failures.remove(name);
      }
      for (name, error) in failed {
        failures.insert(name.to_string(), error.to_string());
      }
      Self::write_file(&path, &serde_json::to_vec_pretty(&failures)?)
    })
  }

  /// Every stored object.
  pub fn list_objects(&self) -> Result<Vec<ObjectInfo>, CacheError> {
    let mut out = Vec::new();
    let objects = self.root.join(OBJECTS_DIR);
    for shard in read_dir(&objects)? {
      if !shard.is_dir() {
        continue;
      }
      for path in read_dir(&shard)? {
        let Some(digest) = json_stem(&path).map(ObjectHash).filter(ObjectHash::is_valid) else {
          continue;
        };
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        out.push(ObjectInfo {
          digest,
          path,
          size,
        });
      }
    }
    out.sort_by(|a, b| a.digest.cmp(&b.digest));
    Ok(out)
  }

  /// Every stored entry, `exists` filled in.
  pub fn list_entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
    let mut out = Vec::new();
    for path in read_dir(&self.root.join(ENTRIES_DIR))? {
      let Some(fingerprint) = json_stem(&path) else {
        continue;
      };
      if let Some(entry) = self.entry(&Fingerprint(fingerprint))? {
        out.push(entry);
      }
    }
    out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(out)
  }
}

fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

fn remove_file(path: &Path) -> Result<bool, CacheError> {
  match fs::remove_file(path) {
    Ok(()) => Ok(true),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(source) => Err(CacheError::Write {
      path: path.to_path_buf(),
      source,
    }),
  }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(source) => {
      return Err(CacheError::Read {
        path: dir.to_path_buf(),
        source,
      });
    }
  };

  let mut out = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|source| CacheError::Read {
      path: dir.to_path_buf(),
      source,
    })?;
    out.push(entry.path());
  }
  Ok(out)
}

fn json_stem(path: &Path) -> Option<String> {
  if path.extension().and_then(|e| e.to_str()) != Some("json") {
    return None;
  }
  path.file_stem().and_then(|s| s.to_str()).map(String::from)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn store() -> (TempDir, CacheStore) {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("store")).unwrap();
    (temp, store)
  }

  fn fp(s: &str) -> Fingerprint {
    Fingerprint(s.to_string())
  }

  #[test]
  fn put_then_get() {
    let (_temp, store) = store();
    let entry = store
      .put(&fp("f1"), "a", &json!([1, 2]), EntryMeta::value(0.5, BTreeMap::new()))
      .unwrap();

    assert!(entry.exists);
    assert_eq!(store.get(&entry.digest).unwrap(), json!([1, 2]));
    assert!(store.is_current(&fp("f1")).unwrap());
    assert!(store.is_outdated(&fp("f2")).unwrap());
  }

  #[test]
  fn identical_values_share_one_object() {
    let (_temp, store) = store();
    let a = store.put(&fp("f1"), "a", &json!({"k": 1}), EntryMeta::value(0.0, BTreeMap::new())).unwrap();
    let b = store.put(&fp("f2"), "b", &json!({"k": 1}), EntryMeta::value(0.0, BTreeMap::new())).unwrap();

    assert_eq!(a.digest, b.digest);
    assert_eq!(store.list_objects().unwrap().len(), 1);
    assert_eq!(store.list_entries().unwrap().len(), 2);
  }

  #[test]
  fn missing_digest_is_not_found() {
    let (_temp, store) = store();
    let err = store.get(&ObjectHash("ab".repeat(32))).unwrap_err();
    assert!(matches!(err, CacheError::NotFound(_)));
  }

  #[test]
  fn malformed_digest_never_reaches_the_filesystem() {
    let (temp, store) = store();
    let victim = temp.path().join("victim.json");
    fs::write(&victim, "{}").unwrap();

    let escape = ObjectHash("../../victim".to_string());
    assert!(matches!(store.purge(&escape), Err(CacheError::InvalidDigest(_))));
    assert!(victim.exists());

    let non_ascii = ObjectHash("aé".to_string());
    assert!(matches!(store.get(&non_ascii), Err(CacheError::InvalidDigest(_))));
    assert!(!store.exists(&non_ascii));
  }

  #[test]
  fn latest_index_roundtrip() {
    let (_temp, store) = store();
    assert!(matches!(store.latest("a"), Err(CacheError::NotFound(_))));

    let digest = store.put_object(&json!(1)).unwrap();
    store.set_latest("a", &fp("f1"), &digest, EntryKind::Value).unwrap();
    assert_eq!(store.latest("a").unwrap().fingerprint, fp("f1"));

    assert!(store.remove_latest("a").unwrap().is_some());
    assert!(store.remove_latest("a").unwrap().is_none());
    assert!(store.names().unwrap().is_empty());
  }

  #[test]
  fn purge_makes_entry_stale() {
    let (_temp, store) = store();
    let entry = store.put(&fp("f1"), "a", &json!("v"), EntryMeta::value(0.0, BTreeMap::new())).unwrap();

    assert!(store.purge(&entry.digest).unwrap());
    assert!(!store.exists(&entry.digest));
    assert!(!store.entry(&fp("f1")).unwrap().unwrap().exists);
    assert!(store.is_outdated(&fp("f1")).unwrap());
    assert!(!store.purge(&entry.digest).unwrap());
  }

  #[test]
  fn remove_entry_keeps_object() {
    let (_temp, store) = store();
    let entry = store.put(&fp("f1"), "a", &json!(3), EntryMeta::value(0.0, BTreeMap::new())).unwrap();

    assert!(store.remove_entry(&fp("f1")).unwrap());
    assert!(store.entry(&fp("f1")).unwrap().is_none());
    assert!(store.exists(&entry.digest));
  }

  #[test]
  fn entry_records_env_and_kind() {
    let (_temp, store) = store();
    let mut env = BTreeMap::new();
    env.insert("SEED".to_string(), "1".to_string());
    store.put(&fp("f1"), "a", &json!(null), EntryMeta::value(1.5, env.clone())).unwrap();
    store.put(&fp("f2"), "d", &json!({"subs": []}), EntryMeta::dynamic(0.0)).unwrap();

    let a = store.entry(&fp("f1")).unwrap().unwrap();
    assert_eq!(a.env, env);
    assert_eq!(a.kind, EntryKind::Value);
    assert_eq!(a.seconds, 1.5);
    assert_eq!(store.entry(&fp("f2")).unwrap().unwrap().kind, EntryKind::Dynamic);
  }

  #[test]
  fn store_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");
    let digest = {
      let store = CacheStore::open(&root).unwrap();
      let entry = store.put(&fp("f1"), "a", &json!(7), EntryMeta::value(0.0, BTreeMap::new())).unwrap();
      store.set_latest("a", &fp("f1"), &entry.digest, EntryKind::Value).unwrap();
      entry.digest
    };

    let store = CacheStore::open(&root).unwrap();
    assert_eq!(store.latest("a").unwrap().digest, digest);
    assert_eq!(store.get(&digest).unwrap(), json!(7));
  }

  #[test]
  fn failures_are_marked_and_cleared() {
    let (_temp, store) = store();
    store.record_failures([("a", "boom"), ("b", "dependency failed")], []).unwrap();
    store.record_failures([], ["a"]).unwrap();

    let failures = store.failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures["b"], "dependency failed");
  }
}
