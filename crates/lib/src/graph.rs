//! Dependency graph construction.
//!
//! Turns a [`Plan`] into a DAG with one node per target and one per import
//! referenced by any command. Edges point from a dependency to its dependent:
//! - data edges for referenced targets, explicit deps and dynamic upstreams
//! - import edges for references resolved against the plan's imports
//! - file edges from the target declaring a file output to every target
//!   declaring the same path as input
//!
//! Construction fails before anything is scheduled when the plan has a
//! cycle, an undefined reference, a duplicate target or an empty dynamic
//! transform.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use serde::Serialize;
use thiserror::Error;

use crate::plan::{Plan, Transform};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("dependency cycle: {}", .cycle.join(" -> "))]
  Cycle { cycle: Vec<String> },

  #[error("target '{target}' references undefined name '{name}'")]
  UndefinedReference { target: String, name: String },

  #[error("duplicate target '{0}'")]
  DuplicateTarget(String),

  #[error("target '{target}': invalid dynamic spec: {message}")]
  InvalidDynamic { target: String, message: String },

  #[error("unknown target '{0}'")]
  UnknownTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
  Target,
  Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
  Data,
  Import,
  File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
  pub name: String,
  pub kind: NodeKind,
}

/// The static dependency graph of a plan.
#[derive(Debug)]
pub struct Graph {
  graph: DiGraph<GraphNode, EdgeKind>,
  nodes: HashMap<String, NodeIndex>,
}

impl Graph {
  /// Build the graph for `plan`.
  pub fn build(plan: &Plan) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

    for def in plan.targets() {
      if nodes.contains_key(&def.name) {
        return Err(GraphError::DuplicateTarget(def.name.clone()));
      }
      let idx = graph.add_node(GraphNode {
        name: def.name.clone(),
        kind: NodeKind::Target,
      });
      nodes.insert(def.name.clone(), idx);
    }

    for def in plan.targets() {
      if let Some(spec) = &def.dynamic {
        validate_transform(&def.name, &spec.transform)?;
      }

      let dependent = nodes[&def.name];
      for name in def.references() {
        if let Some(&dep) = nodes.get(&name)
          && graph[dep].kind == NodeKind::Target
        {
          graph.update_edge(dep, dependent, EdgeKind::Data);
          continue;
        }

        if !plan.imports().contains_key(&name) {
          return Err(GraphError::UndefinedReference {
            target: def.name.clone(),
            name,
          });
        }

        let dep = *nodes.entry(name.clone()).or_insert_with(|| {
          graph.add_node(GraphNode {
            name,
            kind: NodeKind::Import,
          })
        });
        graph.update_edge(dep, dependent, EdgeKind::Import);
      }
    }

    // file outputs become pseudo-dependencies of their consumers
    let mut producers: BTreeMap<PathBuf, NodeIndex> = BTreeMap::new();
    for def in plan.targets() {
      for path in def.all_files_out() {
        producers.insert(path, nodes[&def.name]);
      }
    }
    for def in plan.targets() {
      let consumer = nodes[&def.name];
      for path in def.all_files_in() {
        if let Some(&producer) = producers.get(&path)
          && producer != consumer
          && graph.find_edge(producer, consumer).is_none()
        {
          graph.add_edge(producer, consumer, EdgeKind::File);
        }
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    match toposort(&self.graph, None) {
      Ok(_) => Ok(()),
      Err(_) => Err(GraphError::Cycle {
        cycle: self.find_cycle(),
      }),
    }
  }

  /// One cycle, as a sequence of names where each depends on the next and
  /// the first name is repeated at the end.
  fn find_cycle(&self) -> Vec<String> {
    for scc in tarjan_scc(&self.graph) {
      let start = match scc.iter().min_by_key(|idx| &self.graph[**idx].name) {
        Some(&idx) => idx,
        None => continue,
      };
      let self_loop = self.graph.find_edge(start, start).is_some();
      if scc.len() == 1 && !self_loop {
        continue;
      }

      let members: HashSet<NodeIndex> = scc.iter().copied().collect();
      let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
      let mut queue = VecDeque::from([start]);

      while let Some(current) = queue.pop_front() {
        for dep in self.graph.neighbors_directed(current, Direction::Incoming) {
          if dep == start {
            let mut path = vec![current];
            let mut at = current;
            while let Some(&prev) = parent.get(&at) {
              path.push(prev);
              at = prev;
            }
            path.reverse();
            let mut cycle: Vec<String> = path.iter().map(|i| self.graph[*i].name.clone()).collect();
            cycle.push(self.graph[start].name.clone());
            return cycle;
          }
          if members.contains(&dep) && dep != start && !parent.contains_key(&dep) {
            parent.insert(dep, current);
            queue.push_back(dep);
          }
        }
      }
    }
    Vec::new()
  }

  /// All nodes in an order where dependencies come before dependents.
  pub fn topological_order(&self) -> Vec<String> {
    self.waves().into_iter().flatten().collect()
  }

  /// Parallel levels: every node's dependencies sit in earlier waves.
  ///
  /// Within a wave, nodes keep their insertion order (plan order, imports
  /// after the targets that first referenced them).
  pub fn waves(&self) -> Vec<Vec<String>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let (ready, rest): (Vec<NodeIndex>, Vec<NodeIndex>) = remaining.into_iter().partition(|idx| in_degree[idx] == 0);
      if ready.is_empty() {
        // unreachable for a verified graph
        break;
      }

      for &idx in &ready {
        for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      waves.push(ready.iter().map(|idx| self.graph[*idx].name.clone()).collect());
      remaining = rest;
    }

    waves
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  pub fn kind(&self, name: &str) -> Option<NodeKind> {
    self.nodes.get(name).map(|idx| self.graph[*idx].kind)
  }

  /// Direct dependencies of `name`, sorted.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    self.neighbors(name, Direction::Incoming)
  }

  /// Direct dependents of `name`, sorted.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    self.neighbors(name, Direction::Outgoing)
  }

  fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let mut names: Vec<String> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].name.clone())
      .collect();
    names.sort();
    names.dedup();
    names
  }

  /// `names` plus everything they transitively depend on.
  pub fn with_ancestors<'a, I>(&self, names: I) -> Result<HashSet<String>, GraphError>
  where
    I: IntoIterator<Item = &'a String>,
  {
    let reversed = Reversed(&self.graph);
    let mut out = HashSet::new();
    for name in names {
      let &start = self.nodes.get(name).ok_or_else(|| GraphError::UnknownTarget(name.clone()))?;
      let mut dfs = Dfs::new(reversed, start);
      while let Some(idx) = dfs.next(reversed) {
        out.insert(self.graph[idx].name.clone());
      }
    }
    Ok(out)
  }

  /// Every node in insertion order.
  pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
    self.graph.node_indices().map(|idx| &self.graph[idx])
  }

  /// Every edge as `(dependency, dependent, kind)`.
  pub fn edges(&self) -> Vec<(String, String, EdgeKind)> {
    self
      .graph
      .edge_references()
      .map(|e| {
        (
          self.graph[e.source()].name.clone(),
          self.graph[e.target()].name.clone(),
          *e.weight(),
        )
      })
      .collect()
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }
}

fn validate_transform(target: &str, transform: &Transform) -> Result<(), GraphError> {
  let message = match transform {
    Transform::Map { over } | Transform::Cross { over } if over.is_empty() => {
      Some(format!("{} names no upstream target", transform.kind()))
    }
    Transform::Group { over, by } if over.is_empty() || by.is_empty() => {
      Some("group requires both 'over' and 'by'".to_string())
    }
    _ => {
      let mut names = transform.upstreams();
      names.sort_unstable();
      names
        .windows(2)
        .find(|w| w[0] == w[1])
        .map(|w| format!("upstream '{}' is named twice", w[0]))
    }
  };

  match message {
    Some(message) => Err(GraphError::InvalidDynamic {
      target: target.to_string(),
      message,
    }),
    None => Ok(()),
  }
}
