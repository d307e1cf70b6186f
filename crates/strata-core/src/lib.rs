//! Strata core library: planning and versioning for dependency-linked data
//! transformations.
//!
//! This crate fingerprints model definitions, diffs them against a deployed
//! environment, categorizes each change by its compatibility impact, and
//! computes the exact time ranges that must be (re)computed.  Execution is
//! delegated to a caller-supplied evaluator; state lives behind the
//! `StateSync` trait, with in-memory and SQLite implementations.

pub mod config;
pub mod cron;
pub mod dag;
pub mod environment;
pub mod errors;
pub mod models;
pub mod plan;
pub mod snapshot;
pub mod store;
pub mod time;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::PlannerConfig;
pub use errors::{StrataError, StrataResult};
pub use models::{Computation, ModelDefinition, ModelKind};
pub use plan::{Plan, PlanApplier, PlanBuilder, SnapshotEvaluator};
pub use snapshot::{Snapshot, SnapshotChangeCategory, SnapshotId};
pub use store::{InMemoryStateStore, SqliteStateStore, StateReader, StateSync};
