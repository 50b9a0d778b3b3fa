//! Fingerprints: the stable identity of one exact build of a node.
//!
//! A fingerprint is SHA-256 over the canonical JSON of a small payload. Every
//! map in a payload is a `BTreeMap`, so dependencies are keyed by name and
//! never by plan position; reordering a plan cannot change a fingerprint.
//! Nothing time- or order-dependent enters a payload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::plan::Transform;
use crate::util::hash::{ContentHash, DirHashError, Fingerprint, HashError, Hashable, ObjectHash, hash_path};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum FingerprintError {
  #[error("failed to serialize fingerprint payload: {0}")]
  Serialize(#[from] HashError),

  #[error(transparent)]
  File(#[from] DirHashError),
}

#[derive(Serialize)]
struct TargetPayload<'a> {
  kind: &'static str,
  command: &'a str,
  deps: &'a BTreeMap<String, Fingerprint>,
  files_in: &'a BTreeMap<String, ContentHash>,
  files_out: &'a BTreeMap<String, ContentHash>,
}

impl Hashable for TargetPayload<'_> {}

#[derive(Serialize)]
struct ImportPayload<'a> {
  kind: &'static str,
  value: &'a Value,
}

impl Hashable for ImportPayload<'_> {}

#[derive(Serialize)]
struct SubTargetPayload<'a> {
  kind: &'static str,
  command: &'a str,
  deps: &'a BTreeMap<String, Fingerprint>,
  slices: &'a [(String, ObjectHash)],
}

impl Hashable for SubTargetPayload<'_> {}

#[derive(Serialize)]
struct DynamicPayload<'a> {
  kind: &'static str,
  command: &'a str,
  transform: &'a Transform,
  subs: &'a [Fingerprint],
}

impl Hashable for DynamicPayload<'_> {}

#[derive(Serialize)]
struct SubNamePayload<'a> {
  parent: &'a str,
  slices: &'a [(String, ObjectHash)],
}

impl Hashable for SubNamePayload<'_> {}

/// Fingerprint of a static target.
pub fn target_fingerprint(
  command: &str,
  deps: &BTreeMap<String, Fingerprint>,
  files_in: &BTreeMap<String, ContentHash>,
  files_out: &BTreeMap<String, ContentHash>,
) -> Result<Fingerprint, FingerprintError> {
  let payload = TargetPayload {
    kind: "target",
    command,
    deps,
    files_in,
    files_out,
  };
  Ok(Fingerprint(payload.compute_hash()?))
}

/// Fingerprint of an import: a pure function of its value.
pub fn import_fingerprint(value: &Value) -> Result<Fingerprint, FingerprintError> {
  let payload = ImportPayload { kind: "import", value };
  Ok(Fingerprint(payload.compute_hash()?))
}

/// Fingerprint of one sub-target of a dynamic target.
///
/// `deps` holds the fingerprints of the upstreams that are not sliced;
/// `slices` the digest of each sliced upstream's slice, in transform order.
pub fn sub_target_fingerprint(
  command: &str,
  deps: &BTreeMap<String, Fingerprint>,
  slices: &[(String, ObjectHash)],
) -> Result<Fingerprint, FingerprintError> {
  let payload = SubTargetPayload {
    kind: "sub",
    command,
    deps,
    slices,
  };
  Ok(Fingerprint(payload.compute_hash()?))
}

/// Fingerprint of a dynamic target over its sub-targets, in creation order.
pub fn dynamic_fingerprint(
  command: &str,
  transform: &Transform,
  subs: &[Fingerprint],
) -> Result<Fingerprint, FingerprintError> {
  let payload = DynamicPayload {
    kind: "dynamic",
    command,
    transform,
    subs,
  };
  Ok(Fingerprint(payload.compute_hash()?))
}

/// Name of a sub-target, derived from its parent and slice digests.
///
/// Identical slices yield identical names, so an unchanged slice keeps its
/// sub-target across runs no matter where it moved in the sequence.
pub fn sub_target_name(parent: &str, slices: &[(String, ObjectHash)], suffix_len: usize) -> Result<String, FingerprintError> {
  let hash = SubNamePayload { parent, slices }.compute_hash()?;
  Ok(format!("{}_{}", parent, &hash[..suffix_len.min(hash.len())]))
}

/// Hash each path (relative paths resolve against `root`), keyed by the
/// path as declared.
pub fn hash_files(root: &Path, paths: &[PathBuf]) -> Result<BTreeMap<String, ContentHash>, FingerprintError> {
  let mut out = BTreeMap::new();
  for path in paths {
    let hash = hash_path(&root.join(path))?;
    out.insert(path.to_string_lossy().replace('\\', "/"), hash);
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::MISSING_FILE_HASH;
  use crate::value::value_digest;
  use serde_json::json;
  use tempfile::tempdir;

  fn fp(s: &str) -> Fingerprint {
    Fingerprint(s.to_string())
  }

  fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, Fingerprint> {
    pairs.iter().map(|(k, v)| (k.to_string(), fp(v))).collect()
  }

  #[test]
  fn same_inputs_same_fingerprint() {
    let empty = BTreeMap::new();
    let a = target_fingerprint("x + 1", &deps(&[("x", "aa")]), &empty, &empty).unwrap();
    let b = target_fingerprint("x + 1", &deps(&[("x", "aa")]), &empty, &empty).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.0.len(), 64);
  }

  #[test]
  fn dependency_order_does_not_matter() {
    let empty = BTreeMap::new();
    let a = target_fingerprint("c", &deps(&[("x", "1"), ("y", "2")]), &empty, &empty).unwrap();
    let b = target_fingerprint("c", &deps(&[("y", "2"), ("x", "1")]), &empty, &empty).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn command_and_dependency_changes_propagate() {
    let empty = BTreeMap::new();
    let base = target_fingerprint("c", &deps(&[("x", "1")]), &empty, &empty).unwrap();
    assert_ne!(base, target_fingerprint("d", &deps(&[("x", "1")]), &empty, &empty).unwrap());
    assert_ne!(base, target_fingerprint("c", &deps(&[("x", "2")]), &empty, &empty).unwrap());
  }

  #[test]
  fn import_tracks_value() {
    assert_eq!(
      import_fingerprint(&json!({"a": 1, "b": 2})).unwrap(),
      import_fingerprint(&json!({"b": 2, "a": 1})).unwrap()
    );
    assert_ne!(import_fingerprint(&json!(1)).unwrap(), import_fingerprint(&json!(2)).unwrap());
  }

  #[test]
  fn file_content_enters_fingerprint() {
    let temp = tempdir().unwrap();
    let empty = BTreeMap::new();
    let paths = vec![PathBuf::from("in.txt")];

    let missing = hash_files(temp.path(), &paths).unwrap();
    assert_eq!(missing["in.txt"].0, MISSING_FILE_HASH);

    std::fs::write(temp.path().join("in.txt"), "one").unwrap();
    let one = hash_files(temp.path(), &paths).unwrap();
    let fp_one = target_fingerprint("cat", &empty, &one, &BTreeMap::new()).unwrap();

    std::fs::write(temp.path().join("in.txt"), "one").unwrap();
    let touched = hash_files(temp.path(), &paths).unwrap();
    assert_eq!(fp_one, target_fingerprint("cat", &empty, &touched, &BTreeMap::new()).unwrap());

    std::fs::write(temp.path().join("in.txt"), "two").unwrap();
    let two = hash_files(temp.path(), &paths).unwrap();
    assert_ne!(fp_one, target_fingerprint("cat", &empty, &two, &BTreeMap::new()).unwrap());
  }

  #[test]
  fn sub_target_identity_follows_slice() {
    let slice = vec![("a".to_string(), value_digest(&json!(1)))];
    let other = vec![("a".to_string(), value_digest(&json!(2)))];

    let name = sub_target_name("b", &slice, 8).unwrap();
    assert!(name.starts_with("b_"));
    assert_eq!(name.len(), "b_".len() + 8);
    assert_eq!(name, sub_target_name("b", &slice, 8).unwrap());
    assert_ne!(name, sub_target_name("b", &other, 8).unwrap());

    let empty = BTreeMap::new();
    assert_ne!(
      sub_target_fingerprint("a + 1", &empty, &slice).unwrap(),
      sub_target_fingerprint("a + 1", &empty, &other).unwrap()
    );
  }

  #[test]
  fn dynamic_fingerprint_follows_sub_order() {
    let t = Transform::map(["a"]);
    let ab = dynamic_fingerprint("c", &t, &[fp("1"), fp("2")]).unwrap();
    let ba = dynamic_fingerprint("c", &t, &[fp("2"), fp("1")]).unwrap();
    assert_ne!(ab, ba);
  }
}
