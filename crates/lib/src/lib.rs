//! strata-lib: incremental, content-addressed build pipelines.
//!
//! A [`plan::Plan`] names targets whose commands produce JSON values. The
//! library resolves it into a dependency [`graph::Graph`], fingerprints
//! every node, and rebuilds only what a fingerprint says is missing from
//! the [`cache::CacheStore`]:
//! - `Graph`: static targets and imports, validated and acyclic
//! - dynamic targets expand into sub-targets once upstream values exist
//! - `HistoryLog`: append-only provenance of every build
//! - [`project::Project`]: build, status and query operations on one store

pub mod cache;
pub mod command;
pub mod consts;
pub mod dynamic;
pub mod execute;
pub mod fingerprint;
pub mod gc;
pub mod graph;
pub mod history;
pub mod plan;
pub mod project;
pub mod util;
pub mod value;

pub use project::{Project, ProjectError};
