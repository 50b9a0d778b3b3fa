//! Runtime values and the sequence interface used by dynamic targets.
//!
//! Target values are plain JSON values. The canonical serialization is
//! compact JSON with sorted object keys, which is what [`value_digest`]
//! hashes, so two structurally equal values always get the same digest no
//! matter how they were constructed.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util::hash::ObjectHash;

/// The value produced by a target's command.
pub type Value = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
  #[error("value of type {kind} is not a sequence")]
  NotASequence { kind: &'static str },

  #[error("index {index} out of bounds for sequence of length {length}")]
  OutOfBounds { index: usize, length: usize },
}

/// Sequence-shaped access to a value.
///
/// Only values implementing this can be mapped, crossed or grouped over.
pub trait Sequence {
  fn length(&self) -> Result<usize, SequenceError>;

  fn slice(&self, index: usize) -> Result<Value, SequenceError>;
}

impl Sequence for Value {
  fn length(&self) -> Result<usize, SequenceError> {
    match self {
      Value::Array(items) => Ok(items.len()),
      other => Err(SequenceError::NotASequence { kind: kind_name(other) }),
    }
  }

  fn slice(&self, index: usize) -> Result<Value, SequenceError> {
    match self {
      Value::Array(items) => items.get(index).cloned().ok_or(SequenceError::OutOfBounds {
        index,
        length: items.len(),
      }),
      other => Err(SequenceError::NotASequence { kind: kind_name(other) }),
    }
  }
}

/// Concatenate sub-target values into one sequence.
///
/// Array parts are flattened one level; any other part contributes a single
/// element. N single-element parts therefore yield N elements, and
/// multi-element parts yield their flattened concatenation.
pub fn concat<I>(parts: I) -> Value
where
  I: IntoIterator<Item = Value>,
{
  let mut out = Vec::new();
  for part in parts {
    match part {
      Value::Array(items) => out.extend(items),
      other => out.push(other),
    }
  }
  Value::Array(out)
}

/// Canonical bytes of a value.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
  // serde_json's map is a BTreeMap here, so keys come out sorted
  value.to_string().into_bytes()
}

/// Content digest of a value.
pub fn value_digest(value: &Value) -> ObjectHash {
  ObjectHash(hex::encode(Sha256::digest(canonical_bytes(value))))
}

/// Render a value the way it is substituted into shell commands: strings
/// raw, everything else as compact JSON.
pub fn render(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn kind_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
