//! Dynamic expansion: turning `map`/`cross`/`group` into sub-targets.
//!
//! Expansion runs once the upstreams of a dynamic target are built. Each
//! sub-target gets the slice of every sliced upstream as its input, a name
//! derived from the parent and the slice digests, and a fingerprint over the
//! command, the slice digests and the fingerprints of any other inputs.
//! Unchanged slices therefore keep both their name and their fingerprint
//! across runs, wherever they sit in the upstream sequence.
//!
//! Ordering:
//! - `map` follows sequence position
//! - `cross` is row-major: the first upstream varies slowest, the last fastest
//! - `group` follows the first occurrence of each key
//!
//! The dynamic target's value is the [`concat`] of its sub-target values in
//! that order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::consts::SUB_TARGET_SUFFIX_LEN;
use crate::fingerprint::{FingerprintError, sub_target_fingerprint, sub_target_name};
use crate::plan::{DynamicSpec, Transform};
use crate::util::hash::{Fingerprint, ObjectHash};
use crate::value::{Sequence, SequenceError, Value, concat, value_digest};

/// How `map` treats upstreams of unequal length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPolicy {
  /// Fail with [`ExpandError::LengthMismatch`].
  #[default]
  Strict,
  /// Truncate to the shortest upstream.
  Truncate,
}

impl std::fmt::Display for LengthPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LengthPolicy::Strict => write!(f, "strict"),
      LengthPolicy::Truncate => write!(f, "truncate"),
    }
  }
}

#[derive(Debug, Error)]
pub enum ExpandError {
  #[error("target '{target}': upstream '{upstream}' is not a sequence: {source}")]
  NotASequence {
    target: String,
    upstream: String,
    #[source]
    source: SequenceError,
  },

  #[error("target '{target}': {transform} over sequences of unequal length ({})", format_lengths(.lengths))]
  LengthMismatch {
    target: String,
    transform: &'static str,
    lengths: Vec<(String, usize)>,
  },

  #[error("target '{target}': upstream '{upstream}' has no value")]
  MissingUpstream { target: String, upstream: String },

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),
}

fn format_lengths(lengths: &[(String, usize)]) -> String {
  lengths
    .iter()
    .map(|(name, len)| format!("{name}: {len}"))
    .collect::<Vec<_>>()
    .join(", ")
}

/// One sub-target produced by expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTarget {
  pub name: String,
  pub fingerprint: Fingerprint,
  /// Input overrides: each sliced upstream bound to its slice.
  pub inputs: BTreeMap<String, Value>,
  /// Keys that produced this slice, for the trace.
  pub keys: Value,
}

/// Result of expanding one dynamic target.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
  /// Sub-targets in creation order. Identical slices repeat.
  pub subs: Vec<SubTarget>,
  /// How many sub-targets `max_expand` cut off.
  pub truncated: usize,
}

/// Reference to one sub-target in a [`DynamicIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRef {
  pub name: String,
  pub fingerprint: Fingerprint,
}

/// Which keys produced a sub-target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
  pub sub_target: String,
  pub keys: Value,
}

/// The stored form of a dynamic target: its sub-targets in order and,
/// when tracing is on, the keys behind each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicIndex {
  pub transform: Transform,
  pub sub_targets: Vec<SubRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trace: Option<Vec<TraceEntry>>,
}

impl DynamicIndex {
  pub fn new(spec: &DynamicSpec, expansion: &Expansion) -> Self {
    let sub_targets = expansion
      .subs
      .iter()
      .map(|s| SubRef {
        name: s.name.clone(),
        fingerprint: s.fingerprint.clone(),
      })
      .collect();
    let trace = spec.trace.then(|| {
      expansion
        .subs
        .iter()
        .map(|s| TraceEntry {
          sub_target: s.name.clone(),
          keys: s.keys.clone(),
        })
        .collect()
    });
    Self {
      transform: spec.transform.clone(),
      sub_targets,
      trace,
    }
  }
}

/// Aggregate sub-target values into the dynamic target's value.
pub fn aggregate(values: Vec<Value>) -> Value {
  concat(values)
}

/// Everything expansion needs about one dynamic target.
pub struct ExpandRequest<'a> {
  pub target: &'a str,
  pub spec: &'a DynamicSpec,
  pub command: &'a str,
  /// Built values of the upstreams named by the transform.
  pub upstreams: &'a BTreeMap<String, Value>,
  /// Fingerprints of the target's inputs that are not sliced.
  pub other_deps: &'a BTreeMap<String, Fingerprint>,
  pub policy: LengthPolicy,
  pub max_expand: Option<usize>,
}

/// Expand a dynamic target into its sub-targets.
pub fn expand(req: &ExpandRequest<'_>) -> Result<Expansion, ExpandError> {
  let slices = match &req.spec.transform {
    Transform::Map { over } => map_slices(req, over)?,
    Transform::Cross { over } => cross_slices(req, over)?,
    Transform::Group { over, by } => group_slices(req, over, by)?,
  };

  let total = slices.len();
  let keep = req.max_expand.map_or(total, |cap| cap.min(total));

  let mut subs = Vec::with_capacity(keep);
  for (inputs, keys) in slices.into_iter().take(keep) {
    let digests: Vec<(String, ObjectHash)> = inputs.iter().map(|(name, value)| (name.clone(), value_digest(value))).collect();
    let name = sub_target_name(req.target, &digests, SUB_TARGET_SUFFIX_LEN)?;
    let fingerprint = sub_target_fingerprint(req.command, req.other_deps, &digests)?;
    subs.push(SubTarget {
      name,
      fingerprint,
      inputs: inputs.into_iter().collect(),
      keys,
    });
  }

  debug!(
    target_name = %req.target,
    transform = req.spec.transform.kind(),
    subs = subs.len(),
    truncated = total - keep,
    "expanded dynamic target"
  );

  Ok(Expansion {
    subs,
    truncated: total - keep,
  })
}

/// Slice inputs in transform order plus the trace keys.
type Slice = (Vec<(String, Value)>, Value);

fn upstream<'a>(req: &'a ExpandRequest<'_>, name: &str) -> Result<(&'a Value, usize), ExpandError> {
  let value = req.upstreams.get(name).ok_or_else(|| ExpandError::MissingUpstream {
    target: req.target.to_string(),
    upstream: name.to_string(),
  })?;
  let len = value.length().map_err(|source| ExpandError::NotASequence {
    target: req.target.to_string(),
    upstream: name.to_string(),
    source,
  })?;
  Ok((value, len))
}

fn slice_at(req: &ExpandRequest<'_>, name: &str, value: &Value, index: usize) -> Result<Value, ExpandError> {
  value.slice(index).map_err(|source| ExpandError::NotASequence {
    target: req.target.to_string(),
    upstream: name.to_string(),
    source,
  })
}

fn map_slices(req: &ExpandRequest<'_>, over: &[String]) -> Result<Vec<Slice>, ExpandError> {
  let mut seqs = Vec::with_capacity(over.len());
  for name in over {
    let (value, len) = upstream(req, name)?;
    seqs.push((name, value, len));
  }

  let min = seqs.iter().map(|(_, _, len)| *len).min().unwrap_or(0);
  let max = seqs.iter().map(|(_, _, len)| *len).max().unwrap_or(0);
  if min != max && req.policy == LengthPolicy::Strict {
    return Err(ExpandError::LengthMismatch {
      target: req.target.to_string(),
      transform: "map",
      lengths: seqs.iter().map(|(name, _, len)| ((*name).clone(), *len)).collect(),
    });
  }

  let mut out = Vec::with_capacity(min);
  for i in 0..min {
    let mut inputs = Vec::with_capacity(seqs.len());
    let mut keys = serde_json::Map::new();
    for (name, value, _) in &seqs {
      inputs.push(((*name).clone(), slice_at(req, name, value, i)?));
      keys.insert((*name).clone(), json!(i));
    }
    out.push((inputs, Value::Object(keys)));
  }
  Ok(out)
}

fn cross_slices(req: &ExpandRequest<'_>, over: &[String]) -> Result<Vec<Slice>, ExpandError> {
  let mut seqs = Vec::with_capacity(over.len());
  for name in over {
    let (value, len) = upstream(req, name)?;
    seqs.push((name, value, len));
  }

  let total: usize = seqs.iter().map(|(_, _, len)| *len).product();
  let mut out = Vec::with_capacity(total);

  // row-major odometer: the last upstream turns fastest
  let mut index = vec![0usize; seqs.len()];
  for _ in 0..total {
    let mut inputs = Vec::with_capacity(seqs.len());
    let mut keys = serde_json::Map::new();
    for ((name, value, _), &i) in seqs.iter().zip(&index) {
      inputs.push(((*name).clone(), slice_at(req, name, value, i)?));
      keys.insert((*name).clone(), json!(i));
    }
    out.push((inputs, Value::Object(keys)));

    for pos in (0..index.len()).rev() {
      index[pos] += 1;
      if index[pos] < seqs[pos].2 {
        break;
      }
      index[pos] = 0;
    }
  }
  Ok(out)
}

fn group_slices(req: &ExpandRequest<'_>, over: &str, by: &str) -> Result<Vec<Slice>, ExpandError> {
  let (values, values_len) = upstream(req, over)?;
  let (keys, keys_len) = upstream(req, by)?;

  if values_len != keys_len {
    return Err(ExpandError::LengthMismatch {
      target: req.target.to_string(),
      transform: "group",
      lengths: vec![(over.to_string(), values_len), (by.to_string(), keys_len)],
    });
  }

  // groups in first-occurrence order of their key
  let mut order: Vec<(Value, Vec<Value>)> = Vec::new();
  let mut seen: HashMap<ObjectHash, usize> = HashMap::new();
  for i in 0..values_len {
    let key = slice_at(req, by, keys, i)?;
    let member = slice_at(req, over, values, i)?;
    let slot = *seen.entry(value_digest(&key)).or_insert_with(|| {
      order.push((key.clone(), Vec::new()));
      order.len() - 1
    });
    order[slot].1.push(member);
  }

  Ok(
    order
      .into_iter()
      .map(|(key, members)| {
        let mut keys = serde_json::Map::new();
        keys.insert(by.to_string(), key.clone());
        (
          vec![(over.to_string(), Value::Array(members)), (by.to_string(), key)],
          Value::Object(keys),
        )
      })
      .collect(),
  )
}
