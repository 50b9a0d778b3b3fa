//! A project: a root directory plus the store that caches its builds.
//!
//! [`Project`] is the entry point the CLI and embedding programs use. It
//! owns the [`CacheStore`] and [`HistoryLog`] of one store directory and
//! answers the build, status and query operations against them.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheError, CacheStore, EntryKind};
use crate::consts::{STORE_DIR_NAME, STORE_ENV_VAR};
use crate::dynamic::{self, DynamicIndex, ExpandRequest, LengthPolicy, TraceEntry};
use crate::execute::{self, BuildConfig, BuildError, BuildReport, TargetStatus};
use crate::fingerprint::{FingerprintError, dynamic_fingerprint, hash_files, import_fingerprint, target_fingerprint};
use crate::gc::{GcError, GcResult, collect_garbage};
use crate::graph::{EdgeKind, Graph, GraphError, NodeKind};
use crate::history::{HistoryError, HistoryLog, HistoryRecord};
use crate::plan::{Plan, TargetDef};
use crate::util::hash::{Fingerprint, ObjectHash};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ProjectError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  History(#[from] HistoryError),

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),

  #[error(transparent)]
  Gc(#[from] GcError),

  #[error("'{0}' is not a dynamic target")]
  NotDynamic(String),

  #[error("dynamic target '{0}' was built without tracing")]
  NotTraced(String),

  #[error("corrupt dynamic index for '{name}': {source}")]
  Index {
    name: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Status of one node as seen by [`Project::graph_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
  #[serde(rename = "up to date")]
  UpToDate,
  #[serde(rename = "outdated")]
  Outdated,
  #[serde(rename = "imported")]
  Imported,
  #[serde(rename = "failed")]
  Failed,
}

impl NodeStatus {
  pub fn label(&self) -> &'static str {
    match self {
      NodeStatus::UpToDate => "up to date",
      NodeStatus::Outdated => "outdated",
      NodeStatus::Imported => "imported",
      NodeStatus::Failed => "failed",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
  pub name: String,
  pub kind: NodeKind,
  pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeInfo {
  pub from: String,
  pub to: String,
  pub kind: EdgeKind,
}

/// The dependency graph with per-node status, for external renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphInfo {
  pub nodes: Vec<NodeInfo>,
  pub edges: Vec<EdgeInfo>,
}

/// What a node would be if built now, computed without running anything.
#[derive(Debug, Clone)]
struct Probe {
  /// `None` when an upstream is itself unresolved.
  fingerprint: Option<Fingerprint>,
  outdated: bool,
}

pub struct Project {
  root: PathBuf,
  cache: Arc<CacheStore>,
  history: HistoryLog,
}

impl Project {
  /// Open the project at `root`. The store is `$STRATA_STORE` when set,
  /// otherwise `<root>/.strata`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProjectError> {
    let root = root.into();
    let store = match std::env::var_os(STORE_ENV_VAR) {
      Some(dir) if !dir.is_empty() => PathBuf::from(dir),
      _ => root.join(STORE_DIR_NAME),
    };
    Self::with_store(root, store)
  }

  pub fn with_store(root: impl Into<PathBuf>, store: impl Into<PathBuf>) -> Result<Self, ProjectError> {
    let root = root.into();
    let cache = CacheStore::open(store)?;
    let history = HistoryLog::new(cache.root());
    debug!(root = %root.display(), store = %cache.root().display(), "opened project");
    Ok(Self {
      root,
      cache: Arc::new(cache),
      history,
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn store(&self) -> &Path {
    self.cache.root()
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  /// Build `plan`, then remember which targets failed for status queries.
  pub async fn build(&self, plan: &Plan, config: &BuildConfig) -> Result<BuildReport, ProjectError> {
    let graph = Graph::build(plan)?;
    let report = execute::build(plan, &graph, self.cache.clone(), &self.root, config).await?;

    let mut failed = Vec::new();
    let mut succeeded = Vec::new();
    for (name, target) in &report.targets {
      match &target.status {
        TargetStatus::Failed { error } => failed.push((name.as_str(), error.as_str())),
        TargetStatus::DependencyFailed { .. } => failed.push((name.as_str(), target.status.label())),
        status if status.is_done() => succeeded.push(name.as_str()),
        _ => {}
      }
    }
    self.cache.record_failures(failed, succeeded)?;

    Ok(report)
  }

  /// Targets that would run if `plan` were built now, in dependency order.
  ///
  /// Dynamic targets are probed through the cached values of their
  /// upstreams; one whose upstreams are themselves outdated counts as
  /// outdated without being expanded.
  pub fn outdated(&self, plan: &Plan) -> Result<Vec<String>, ProjectError> {
    let graph = Graph::build(plan)?;
    let probes = self.probe(plan, &graph)?;
    Ok(
      graph
        .topological_order()
        .into_iter()
        .filter(|name| graph.kind(name) == Some(NodeKind::Target))
        .filter(|name| probes.get(name).is_some_and(|p| p.outdated))
        .collect(),
    )
  }

  /// Nodes, edges and per-node status of `plan`.
  pub fn graph_info(&self, plan: &Plan) -> Result<GraphInfo, ProjectError> {
    let graph = Graph::build(plan)?;
    let probes = self.probe(plan, &graph)?;
    let failures = self.cache.failures()?;

    let nodes = graph
      .nodes()
      .map(|node| {
        let status = match node.kind {
          NodeKind::Import => NodeStatus::Imported,
          NodeKind::Target if failures.contains_key(&node.name) => NodeStatus::Failed,
          NodeKind::Target if probes.get(&node.name).is_some_and(|p| p.outdated) => NodeStatus::Outdated,
          NodeKind::Target => NodeStatus::UpToDate,
        };
        NodeInfo {
          name: node.name.clone(),
          kind: node.kind,
          status,
        }
      })
      .collect();

    let edges = graph
      .edges()
      .into_iter()
      .map(|(from, to, kind)| EdgeInfo { from, to, kind })
      .collect();

    Ok(GraphInfo { nodes, edges })
  }

  fn probe(&self, plan: &Plan, graph: &Graph) -> Result<HashMap<String, Probe>, ProjectError> {
    let mut probes: HashMap<String, Probe> = HashMap::new();

    for name in graph.topological_order() {
      let probe = match graph.kind(&name) {
        Some(NodeKind::Import) => match plan.imports().get(&name) {
          Some(value) => Probe {
            fingerprint: Some(import_fingerprint(value)?),
            outdated: false,
          },
          None => continue,
        },
        _ => {
          let Some(def) = plan.get(&name) else {
            continue;
          };
          let deps: Option<BTreeMap<String, Fingerprint>> = graph
            .dependencies(&name)
            .into_iter()
            .map(|dep| {
              let fp = probes.get(&dep).and_then(|p| p.fingerprint.clone());
              fp.map(|fp| (dep, fp))
            })
            .collect();
          match deps {
            None => Probe {
              fingerprint: None,
              outdated: true,
            },
            Some(deps) if def.dynamic.is_some() => self.probe_dynamic(def, deps)?,
            Some(deps) => {
              let files_in = hash_files(&self.root, &def.all_files_in())?;
              let files_out = hash_files(&self.root, &def.all_files_out())?;
              let fp = target_fingerprint(&def.command.body(), &deps, &files_in, &files_out)?;
              Probe {
                outdated: self.cache.is_outdated(&fp)?,
                fingerprint: Some(fp),
              }
            }
          }
        }
      };
      probes.insert(name, probe);
    }

    Ok(probes)
  }

  fn probe_dynamic(&self, def: &TargetDef, mut deps: BTreeMap<String, Fingerprint>) -> Result<Probe, ProjectError> {
    let unresolved = Probe {
      fingerprint: None,
      outdated: true,
    };
    let Some(spec) = &def.dynamic else {
      return Ok(unresolved);
    };

    let mut upstreams = BTreeMap::new();
    for upstream in spec.transform.upstreams() {
      let Some(fp) = deps.remove(upstream) else {
        return Ok(unresolved);
      };
      let Some(entry) = self.cache.entry(&fp)?.filter(|e| e.exists) else {
        return Ok(unresolved);
      };
      // a dynamic upstream with a purged sub-target cannot be sliced
      match self.resolve(upstream, &entry.digest, entry.kind) {
        Ok(value) => upstreams.insert(upstream.to_string(), value),
        Err(ProjectError::Cache(CacheError::Gone(_) | CacheError::NotFound(_))) => return Ok(unresolved),
        Err(e) => return Err(e),
      };
    }
    for (path, hash) in hash_files(&self.root, &def.all_files_in())? {
      deps.insert(format!("file_in:{path}"), Fingerprint(hash.0));
    }

    let body = def.command.body();
    let request = ExpandRequest {
      target: &def.name,
      spec,
      command: &body,
      upstreams: &upstreams,
      other_deps: &deps,
      // a strict mismatch never reached the cache, so the probe misses either way
      policy: LengthPolicy::Truncate,
      max_expand: None,
    };
    let Ok(expansion) = dynamic::expand(&request) else {
      return Ok(unresolved);
    };

    let mut outdated = false;
    for sub in &expansion.subs {
      outdated |= self.cache.is_outdated(&sub.fingerprint)?;
    }
    let subs: Vec<Fingerprint> = expansion.subs.iter().map(|s| s.fingerprint.clone()).collect();
    let fp = dynamic_fingerprint(&body, &spec.transform, &subs)?;
    outdated |= self.cache.is_outdated(&fp)?;

    Ok(Probe {
      fingerprint: Some(fp),
      outdated,
    })
  }

  /// The value of one build: dynamic builds aggregate their sub-targets.
  ///
  /// `kind` comes from the record that names `digest`, so a dynamic index
  /// resolves correctly even after its cache entry was cleaned.
  fn resolve(&self, name: &str, digest: &ObjectHash, kind: EntryKind) -> Result<Value, ProjectError> {
    if !self.cache.exists(digest) {
      return Err(CacheError::Gone(digest.0.clone()).into());
    }
    let value = self.cache.get(digest)?;
    if kind != EntryKind::Dynamic {
      return Ok(value);
    }

    let index = self.index(name, value)?;
    let mut parts = Vec::with_capacity(index.sub_targets.len());
    for sub in &index.sub_targets {
      let entry = self
        .cache
        .entry(&sub.fingerprint)?
        .ok_or_else(|| CacheError::NotFound(sub.name.clone()))?;
      parts.push(self.resolve(&sub.name, &entry.digest, entry.kind)?);
    }
    Ok(dynamic::aggregate(parts))
  }

  fn index(&self, name: &str, value: Value) -> Result<DynamicIndex, ProjectError> {
    serde_json::from_value(value).map_err(|source| ProjectError::Index {
      name: name.to_string(),
      source,
    })
  }

  /// History records for `name`, or for every name.
  pub fn history(&self, name: Option<&str>, latest_only: bool) -> Result<Vec<HistoryRecord>, ProjectError> {
    Ok(self.history.query(name, latest_only, &self.cache)?)
  }

  /// The latest value of `name`.
  pub fn get_by_name(&self, name: &str) -> Result<Value, ProjectError> {
    let record = self.cache.latest(name)?;
    self.resolve(name, &record.digest, record.kind)
  }

  /// A stored value by digest. A digest that history knows about but the
  /// store no longer holds is reported gone.
  pub fn get_by_digest(&self, digest: &ObjectHash) -> Result<Value, ProjectError> {
    let digest = &ObjectHash::parse(&digest.0).map_err(CacheError::from)?;
    if self.cache.exists(digest) {
      return Ok(self.cache.get(digest)?);
    }
    let known = self.history.read_all()?.iter().any(|r| &r.digest == digest);
    if known {
      Err(CacheError::Gone(digest.0.clone()).into())
    } else {
      Err(CacheError::NotFound(digest.0.clone()).into())
    }
  }

  /// The keys behind each sub-target of a traced dynamic target.
  pub fn trace(&self, name: &str) -> Result<Vec<TraceEntry>, ProjectError> {
    let record = self.cache.latest(name)?;
    if record.kind != EntryKind::Dynamic {
      return Err(ProjectError::NotDynamic(name.to_string()));
    }
    if !self.cache.exists(&record.digest) {
      return Err(CacheError::Gone(record.digest.0).into());
    }
    let index = self.index(name, self.cache.get(&record.digest)?)?;
    index.trace.ok_or_else(|| ProjectError::NotTraced(name.to_string()))
  }

  /// The value a history record points at, or `Gone`.
  pub fn recover(&self, record: &HistoryRecord) -> Result<Value, ProjectError> {
    self.resolve(&record.name, &record.digest, record.kind)
  }

  /// Forget the latest build of each name (every name when `names` is
  /// empty) so it rebuilds. Values stay in the store for history.
  pub fn clean(&self, names: &[String]) -> Result<Vec<String>, ProjectError> {
    let targets: Vec<String> = if names.is_empty() {
      self.cache.names()?.into_keys().collect()
    } else {
      names.to_vec()
    };

    let mut cleaned = Vec::new();
    for name in targets {
      if let Some(record) = self.cache.remove_latest(&name)? {
        self.cache.remove_entry(&record.fingerprint)?;
        cleaned.push(name);
      }
    }
    info!(count = cleaned.len(), "cleaned targets");
    Ok(cleaned)
  }

  pub fn gc(&self, dry_run: bool) -> Result<GcResult, ProjectError> {
    Ok(collect_garbage(&self.cache, dry_run)?)
  }

  /// Delete one stored value. Returns false when it was already absent.
  pub fn purge(&self, digest: &ObjectHash) -> Result<bool, ProjectError> {
    Ok(self.cache.purge(digest)?)
  }
}
