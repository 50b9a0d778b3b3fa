//! Hashing utilities for content-addressed storage and change detection.
//!
//! This module provides:
//! - `ObjectHash`: the digest of a stored value (its object id in the cache)
//! - `Fingerprint`: the digest identifying one exact build of a target
//! - `ContentHash`: a digest of file or directory content
//! - `hash_path()`: content hashing for declared file inputs/outputs

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::MISSING_FILE_HASH;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a stored value.
///
/// The hash is the full 64-character SHA-256 of the value's canonical JSON
/// serialization, so two structurally equal values always share one object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

/// Digest text that is not 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest '{0}': expected 64 lowercase hex characters")]
pub struct InvalidDigest(pub String);

impl ObjectHash {
  pub const LEN: usize = 64;

  /// Parse user-supplied digest text.
  pub fn parse(s: &str) -> Result<Self, InvalidDigest> {
    let hash = ObjectHash(s.to_string());
    if hash.is_valid() { Ok(hash) } else { Err(InvalidDigest(s.to_string())) }
  }

  /// Whether this is a well-formed SHA-256 hex digest, safe to use as a
  /// file name.
  pub fn is_valid(&self) -> bool {
    self.0.len() == Self::LEN && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The fingerprint of a target: a digest over its command body, the
/// fingerprints of its dependencies and the content of its declared files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  /// Short form used in log lines and CLI output.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(12)]
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Types whose canonical JSON form can be hashed.
///
/// Struct fields serialize in declaration order and every map used in a
/// hashed type is a `BTreeMap`, so the serialized form is canonical.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<String, HashError> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hex::encode(Sha256::digest(&serialized)))
  }
}

/// A full 64-character SHA256 hash of file or directory content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during file or directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Hash whatever currently lives at `path`.
///
/// Files hash by content, directories by [`hash_directory`], and a path that
/// does not exist hashes to the fixed `missing` marker so that its later
/// appearance changes every fingerprint that depends on it.
pub fn hash_path(path: &Path) -> Result<ContentHash, DirHashError> {
  match fs::metadata(path) {
    Ok(meta) if meta.is_dir() => hash_directory(path, &[]),
    Ok(_) => hash_file(path),
    Err(_) => Ok(ContentHash(MISSING_FILE_HASH.to_string())),
  }
}

/// Compute a deterministic hash of a directory's contents.
///
/// The hash covers file contents, directory structure and symlink targets,
/// never timestamps or permissions. Entries are sorted by path.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut file = fs::File::open(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use tempfile::tempdir;

  #[derive(Serialize)]
  struct Sample {
    name: String,
    deps: BTreeMap<String, String>,
  }

  impl Hashable for Sample {}

  #[test]
  fn hashable_is_deterministic_across_insertion_order() {
    let mut a = BTreeMap::new();
    a.insert("x".to_string(), "1".to_string());
    a.insert("y".to_string(), "2".to_string());

    let mut b = BTreeMap::new();
    b.insert("y".to_string(), "2".to_string());
    b.insert("x".to_string(), "1".to_string());

    let s1 = Sample { name: "t".into(), deps: a };
    let s2 = Sample { name: "t".into(), deps: b };
    assert_eq!(s1.compute_hash().unwrap(), s2.compute_hash().unwrap());
    assert_eq!(s1.compute_hash().unwrap().len(), 64);
  }

  #[test]
  fn hash_empty_directory() {
    let temp = tempdir().unwrap();
    let hash = hash_directory(temp.path(), &[]).unwrap();
    assert_eq!(hash.0.len(), 64);
  }

  #[test]
  fn hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn hash_respects_exclusions() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "content").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::create_dir(temp.path().join("tmp")).unwrap();
    fs::write(temp.path().join("tmp/scratch"), "temp").unwrap();
    let hash2 = hash_directory(temp.path(), &["tmp"]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn rewriting_identical_content_keeps_file_hash() {
    let temp = tempdir().unwrap();
    let file = temp.path().join("data.csv");
    fs::write(&file, "a,b\n1,2\n").unwrap();
    let before = hash_path(&file).unwrap();

    // touch: same bytes, new mtime
    fs::write(&file, "a,b\n1,2\n").unwrap();
    assert_eq!(before, hash_path(&file).unwrap());
  }

  #[test]
  fn missing_path_hashes_to_marker() {
    let temp = tempdir().unwrap();
    let hash = hash_path(&temp.path().join("nope")).unwrap();
    assert_eq!(hash.0, MISSING_FILE_HASH);
  }

  #[test]
  fn object_hash_parse_accepts_only_sha256_hex() {
    let digest = hash_bytes(b"x").0;
    assert_eq!(ObjectHash::parse(&digest).unwrap().0, digest);

    assert!(ObjectHash::parse("aé").is_err());
    assert!(ObjectHash::parse("../victim").is_err());
    assert!(ObjectHash::parse(&digest.to_uppercase()).is_err());
    assert!(ObjectHash::parse(&digest[..63]).is_err());
    assert!(!ObjectHash(format!("{}/", &digest[..63])).is_valid());
  }

  #[test]
  fn fingerprint_short_form() {
    let fp = Fingerprint("0123456789abcdef0123".to_string());
    assert_eq!(fp.short(), "0123456789ab");
  }
}
