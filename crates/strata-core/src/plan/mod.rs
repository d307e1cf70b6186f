//! Planning: diff, deployability, scheduling and the plan itself.

pub mod apply;
pub mod builder;
pub mod context_diff;
pub mod definition;
pub mod deployability;
pub mod scheduler;
pub mod selector;

pub use apply::{ApplyReport, PlanApplier, SnapshotEvaluator};
pub use builder::PlanBuilder;
pub use context_diff::{check_dependencies, ContextDiff};
pub use definition::{PhysicalTarget, Plan};
pub use deployability::DeployabilityIndex;
pub use scheduler::{
    execution_order, expand_restatements, EvaluationTask, IntervalScheduler, SnapshotIntervals,
};
pub use selector::select;
