//! The scheduler: dependency-ordered, parallel, incremental execution.
//!
//! Nodes live in an arena indexed by [`NodeId`]. Each node counts the
//! dependencies it still waits on; a node whose count drops to zero joins
//! the ready queue. Ready nodes are dispatched as jobs into a `JoinSet`,
//! with a semaphore bounding how many run at once.
//!
//! Dynamic targets expand once their upstreams are done. Expansion pushes
//! new sub-target nodes onto a pending-insertion queue that the loop drains
//! before dispatching again; the dynamic node then waits on its sub-targets
//! and is finalized after the last one completes.
//!
//! ```text
//! Pending ──> Running ──> Done | Failed            (static, sub-target, import)
//! Pending ──> Running ──> Expanding ──> Running ──> Done | Failed   (dynamic)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::job::{Built, ExpandJob, FinalizeJob, Job, JobContext, JobOutput, TargetJob};
use super::types::{BuildConfig, BuildError, NodeError, OnFailure, TargetReport, TargetStatus};
use crate::command::CommandError;
use crate::dynamic::{Expansion, SubTarget};
use crate::fingerprint::import_fingerprint;
use crate::graph::{Graph, NodeKind};
use crate::plan::Plan;
use crate::util::hash::Fingerprint;
use crate::value::Value;

pub(crate) type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
  Pending,
  Running,
  Expanding,
  Done,
  Failed,
}

#[derive(Debug)]
enum NodeRole {
  Import(Value),
  Static(usize),
  Dynamic { def: usize, expansion: Option<Expansion> },
  Sub { def: usize, parent: NodeId, sub: SubTarget },
}

#[derive(Debug)]
struct Node {
  name: String,
  role: NodeRole,
  state: NodeState,
  deps: Vec<NodeId>,
  dependents: Vec<NodeId>,
  waiting: usize,
  built: Option<Built>,
  status: Option<TargetStatus>,
}

impl Node {
  fn new(name: String, role: NodeRole) -> Self {
    Self {
      name,
      role,
      state: NodeState::Pending,
      deps: Vec::new(),
      dependents: Vec::new(),
      waiting: 0,
      built: None,
      status: None,
    }
  }

  fn is_terminal(&self) -> bool {
    matches!(self.state, NodeState::Done | NodeState::Failed)
  }
}

/// Everything one build run needs.
pub(crate) struct Scheduler<'a> {
  plan: &'a Plan,
  config: &'a BuildConfig,
  ctx: JobContext,
  nodes: Vec<Node>,
  by_name: HashMap<String, NodeId>,
  ready: VecDeque<NodeId>,
  /// Nodes created mid-run, waiting to enter the arena's ready set.
  inserts: VecDeque<NodeId>,
  halted: Arc<AtomicBool>,
  truncated: usize,
}

/// `None` when the job was cancelled before it started.
type TaskResult = (NodeId, Option<Result<JobOutput, NodeError>>);

impl<'a> Scheduler<'a> {
  pub fn new(plan: &'a Plan, graph: &Graph, config: &'a BuildConfig, ctx: JobContext) -> Result<Self, BuildError> {
    let selected: Option<HashSet<String>> = match &config.targets {
      Some(names) => Some(graph.with_ancestors(names)?),
      None => None,
    };

    let defs: HashMap<&str, usize> = plan
      .targets()
      .iter()
      .enumerate()
      .map(|(i, def)| (def.name.as_str(), i))
      .collect();

    let mut scheduler = Self {
      plan,
      config,
      ctx,
      nodes: Vec::new(),
      by_name: HashMap::new(),
      ready: VecDeque::new(),
      inserts: VecDeque::new(),
      halted: Arc::new(AtomicBool::new(false)),
      truncated: 0,
    };

    for name in graph.topological_order() {
      if selected.as_ref().is_some_and(|s| !s.contains(&name)) {
        continue;
      }

      let role = match graph.kind(&name) {
        Some(NodeKind::Import) => match plan.imports().get(&name) {
          Some(value) => NodeRole::Import(value.clone()),
          None => continue,
        },
        _ => {
          let Some(&def) = defs.get(name.as_str()) else {
            continue;
          };
          if plan.targets()[def].dynamic.is_some() {
            NodeRole::Dynamic { def, expansion: None }
          } else {
            NodeRole::Static(def)
          }
        }
      };

      let id = scheduler.nodes.len();
      let mut node = Node::new(name.clone(), role);
      for dep in graph.dependencies(&name) {
        if let Some(&dep_id) = scheduler.by_name.get(&dep) {
          node.deps.push(dep_id);
          scheduler.nodes[dep_id].dependents.push(id);
        }
      }
      node.waiting = node.deps.len();
      scheduler.nodes.push(node);
      scheduler.by_name.insert(name, id);
      if scheduler.nodes[id].waiting == 0 {
        scheduler.ready.push_back(id);
      }
    }

    Ok(scheduler)
  }

  /// Run to completion and report every target.
  pub async fn run(mut self) -> Result<(BTreeMap<String, TargetReport>, usize), BuildError> {
    let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
    let mut join_set: JoinSet<TaskResult> = JoinSet::new();

    info!(nodes = self.nodes.len(), workers = self.config.workers, "starting build");

    loop {
      while let Some(id) = self.inserts.pop_front() {
        if self.nodes[id].waiting == 0 {
          self.ready.push_back(id);
        }
      }

      while let Some(id) = self.ready.pop_front() {
        if self.halted.load(Ordering::SeqCst) || self.nodes[id].is_terminal() {
          continue;
        }
        if let Some(job) = self.prepare(id) {
          self.spawn(&mut join_set, &semaphore, id, job);
        }
      }

      if !self.inserts.is_empty() || !self.ready.is_empty() {
        continue;
      }

      let Some(joined) = join_set.join_next().await else {
        break;
      };

      match joined {
        Ok((id, Some(Ok(JobOutput::Built(built))))) => self.complete(id, built),
        Ok((id, Some(Ok(JobOutput::Expanded(expansion))))) => self.expanded(id, expansion),
        Ok((id, Some(Err(e)))) => self.fail(id, e.to_string()),
        Ok((id, None)) => debug!(name = %self.nodes[id].name, "cancelled"),
        Err(e) => {
          error!(error = %e, "build task panicked");
          return Err(BuildError::Task(e.to_string()));
        }
      }
    }

    Ok(self.into_report())
  }

  fn spawn(&self, join_set: &mut JoinSet<TaskResult>, semaphore: &Arc<Semaphore>, id: NodeId, job: Job) {
    let semaphore = semaphore.clone();
    let halted = self.halted.clone();
    let ctx = self.ctx.clone();
    let name = self.nodes[id].name.clone();

    join_set.spawn(async move {
      let Ok(_permit) = semaphore.acquire_owned().await else {
        return (id, None);
      };
      if halted.load(Ordering::SeqCst) {
        return (id, None);
      }

      let result = tokio::task::spawn_blocking(move || job.run(&ctx)).await;
      match result {
        Ok(outcome) => (id, Some(outcome)),
        Err(e) => {
          warn!(name = %name, error = %e, "job panicked");
          (id, Some(Err(NodeError::Command(CommandError::Panicked(e.to_string())))))
        }
      }
    });
  }

  /// Turn a ready node into a job, or settle it inline.
  fn prepare(&mut self, id: NodeId) -> Option<Job> {
    let plan = self.plan;

    match &self.nodes[id].role {
      NodeRole::Import(value) => {
        match import_fingerprint(value) {
          Ok(fingerprint) => {
            let built = Built {
              fingerprint,
              value: value.clone(),
              ran: false,
              seconds: 0.0,
            };
            self.complete(id, built);
          }
          Err(e) => self.fail(id, e.to_string()),
        }
        None
      }
      NodeRole::Static(def) => {
        let def = &plan.targets()[*def];
        let (values, deps) = self.inputs(id);
        self.nodes[id].state = NodeState::Running;
        Some(Job::Target(TargetJob {
          name: def.name.clone(),
          command: def.command.clone(),
          values,
          deps,
          files_in: def.all_files_in(),
          files_out: def.all_files_out(),
          fingerprint: None,
        }))
      }
      NodeRole::Sub { def, parent, sub } => {
        let def = &plan.targets()[*def];
        let (mut values, mut deps) = self.inputs(*parent);
        for (name, slice) in &sub.inputs {
          values.insert(name.clone(), slice.clone());
          deps.remove(name);
        }
        let job = TargetJob {
          name: sub.name.clone(),
          command: def.command.clone(),
          values,
          deps,
          files_in: Vec::new(),
          files_out: Vec::new(),
          fingerprint: Some(sub.fingerprint.clone()),
        };
        self.nodes[id].state = NodeState::Running;
        Some(Job::Target(job))
      }
      NodeRole::Dynamic { def, expansion } => {
        let def = &plan.targets()[*def];
        let spec = def.dynamic.clone()?;

        match expansion {
          None => {
            let (values, mut deps) = self.inputs(id);
            let upstream_names = spec.transform.upstreams();
            let upstreams: BTreeMap<String, Value> = values
              .into_iter()
              .filter(|(name, _)| upstream_names.contains(&name.as_str()))
              .collect();
            deps.retain(|name, _| !upstream_names.contains(&name.as_str()));

            self.nodes[id].state = NodeState::Running;
            Some(Job::Expand(ExpandJob {
              name: def.name.clone(),
              spec,
              body: def.command.body(),
              upstreams,
              other_deps: deps,
              files_in: def.all_files_in(),
              policy: self.config.length_policy(),
              max_expand: self.config.max_expand,
            }))
          }
          Some(expansion) => {
            let expansion = expansion.clone();
            let values = expansion
              .subs
              .iter()
              .map(|s| {
                self
                  .by_name
                  .get(&s.name)
                  .and_then(|sid| self.nodes[*sid].built.as_ref())
                  .map(|b| b.value.clone())
                  .unwrap_or(Value::Null)
              })
              .collect();
            self.nodes[id].state = NodeState::Running;
            Some(Job::Finalize(FinalizeJob {
              name: def.name.clone(),
              spec,
              body: def.command.body(),
              expansion,
              values,
            }))
          }
        }
      }
    }
  }

  /// Values and fingerprints of a node's built dependencies.
  fn inputs(&self, id: NodeId) -> (BTreeMap<String, Value>, BTreeMap<String, Fingerprint>) {
    let mut values = BTreeMap::new();
    let mut fps = BTreeMap::new();
    for &dep in &self.nodes[id].deps {
      let node = &self.nodes[dep];
      if let Some(built) = &node.built
        && !matches!(node.role, NodeRole::Sub { .. })
      {
        values.insert(node.name.clone(), built.value.clone());
        fps.insert(node.name.clone(), built.fingerprint.clone());
      }
    }
    (values, fps)
  }

  /// Insert sub-target nodes for an expanded dynamic target.
  fn expanded(&mut self, id: NodeId, expansion: Expansion) {
    let Some(def) = (match &self.nodes[id].role {
      NodeRole::Dynamic { def, .. } => Some(*def),
      _ => None,
    }) else {
      return;
    };

    self.truncated += expansion.truncated;
    let mut subs: Vec<NodeId> = Vec::new();

    for sub in &expansion.subs {
      let sub_id = match self.by_name.get(&sub.name) {
        Some(&existing) => match &self.nodes[existing].role {
          NodeRole::Sub { parent, .. } if *parent == id => existing,
          _ => {
            self.fail(id, NodeError::NameCollision(sub.name.clone()).to_string());
            return;
          }
        },
        None => {
          let sub_id = self.nodes.len();
          let mut node = Node::new(
            sub.name.clone(),
            NodeRole::Sub {
              def,
              parent: id,
              sub: sub.clone(),
            },
          );
          node.dependents.push(id);
          self.nodes.push(node);
          self.by_name.insert(sub.name.clone(), sub_id);
          self.inserts.push_back(sub_id);
          sub_id
        }
      };
      if !subs.contains(&sub_id) {
        subs.push(sub_id);
      }
    }

    debug!(name = %self.nodes[id].name, subs = subs.len(), "inserted sub-targets");

    let node = &mut self.nodes[id];
    node.waiting = subs.len();
    node.deps.extend(subs);
    node.state = NodeState::Expanding;
    if let NodeRole::Dynamic { expansion: slot, .. } = &mut node.role {
      *slot = Some(expansion);
    }
    if node.waiting == 0 {
      self.ready.push_back(id);
    }
  }

  fn complete(&mut self, id: NodeId, built: Built) {
    let node = &mut self.nodes[id];
    node.state = NodeState::Done;
    node.status = Some(if built.ran {
      TargetStatus::Built
    } else {
      TargetStatus::UpToDate
    });
    node.built = Some(built);

    for dependent in node.dependents.clone() {
      let dep = &mut self.nodes[dependent];
      dep.waiting = dep.waiting.saturating_sub(1);
      if dep.waiting == 0 && !dep.is_terminal() {
        self.ready.push_back(dependent);
      }
    }
  }

  fn fail(&mut self, id: NodeId, error: String) {
    let name = self.nodes[id].name.clone();
    error!(name = %name, error = %error, "target failed");

    let node = &mut self.nodes[id];
    node.state = NodeState::Failed;
    node.status = Some(TargetStatus::Failed { error });

    let mut stack: Vec<NodeId> = self.nodes[id].dependents.clone();
    while let Some(dependent) = stack.pop() {
      let node = &mut self.nodes[dependent];
      if node.is_terminal() {
        continue;
      }
      node.state = NodeState::Failed;
      node.status = Some(TargetStatus::DependencyFailed {
        dependency: name.clone(),
      });
      stack.extend(node.dependents.iter().copied());
    }

    if self.config.on_failure == OnFailure::Halt {
      self.halted.store(true, Ordering::SeqCst);
    }
  }

  fn into_report(self) -> (BTreeMap<String, TargetReport>, usize) {
    let mut targets = BTreeMap::new();
    for node in &self.nodes {
      let parent = match &node.role {
        NodeRole::Import(_) => continue,
        NodeRole::Sub { parent, .. } => Some(self.nodes[*parent].name.clone()),
        _ => None,
      };
      let status = node.status.clone().unwrap_or(TargetStatus::Cancelled);
      targets.insert(
        node.name.clone(),
        TargetReport {
          status,
          fingerprint: node.built.as_ref().map(|b| b.fingerprint.clone()),
          seconds: node.built.as_ref().map_or(0.0, |b| b.seconds),
          parent,
        },
      );
    }
    (targets, self.truncated)
  }
}
