//! Plan application: evaluation hand-off, interval bookkeeping, promotion.

use tracing::{debug, info};

use crate::errors::{StrataError, StrataResult};
use crate::plan::definition::Plan;
use crate::plan::scheduler::EvaluationTask;
use crate::snapshot::{Interval, Snapshot};
use crate::store::{live_plan_id, StateSync};
use crate::time::Timestamp;

/// Computes and writes the data of one bucket of one snapshot.
pub trait SnapshotEvaluator {
    fn evaluate(&self, snapshot: &Snapshot, interval: Interval, deployable: bool)
        -> StrataResult<()>;
}

/// Outcome of a successful application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub plan_id: String,
    pub environment: String,
    pub pushed_snapshots: usize,
    /// Buckets recorded as complete, in the order they ran.
    pub completed: Vec<EvaluationTask>,
    /// Buckets were recorded without calling the evaluator.
    pub empty_backfill: bool,
}

pub struct PlanApplier<'a> {
    state: &'a dyn StateSync,
}

impl<'a> PlanApplier<'a> {
    pub fn new(state: &'a dyn StateSync) -> Self {
        Self { state }
    }

    fn check_base(&self, plan: &Plan, now: Timestamp) -> StrataResult<()> {
        let current = self.state.get_environment(&plan.environment)?;
        let found = live_plan_id(current.as_ref(), now);
        if found != plan.base_plan_id {
            return Err(StrataError::StaleBase {
                environment: plan.environment.clone(),
                expected: plan.base_plan_id.clone(),
                found,
            });
        }
        Ok(())
    }

    /// Apply `plan` at `now`.
    ///
    /// Intervals are recorded as each bucket completes, so a failed
    /// evaluation leaves earlier buckets recorded and the environment
    /// untouched.
    pub fn apply(
        &self,
        plan: &Plan,
        evaluator: &dyn SnapshotEvaluator,
        now: Timestamp,
    ) -> StrataResult<ApplyReport> {
        plan.ensure_categorized()?;
        self.check_base(plan, now)?;

        let new_snapshots: Vec<Snapshot> = plan.new_snapshots().cloned().collect();
        self.state.push_snapshots(&new_snapshots)?;

        for (id, interval) in &plan.restatements {
            if let Some(snapshot) = plan.snapshots.get(&id.name) {
                self.state.remove_interval(
                    std::slice::from_ref(snapshot),
                    *interval,
                    plan.is_dev,
                )?;
            }
        }

        let mut completed = Vec::new();
        for task in plan.execution_order() {
            let snapshot = plan.snapshots.get(&task.snapshot_id.name).ok_or_else(|| {
                StrataError::Evaluation {
                    snapshot: task.snapshot_id.clone(),
                    reason: "snapshot is not part of the plan".to_string(),
                }
            })?;
            if !plan.empty_backfill {
                evaluator.evaluate(snapshot, task.interval, task.deployable)?;
            }
            self.state
                .add_interval(snapshot, task.interval, !task.deployable)?;
            debug!(
                snapshot = %task.snapshot_id,
                start = task.interval.0,
                end = task.interval.1,
                "interval complete"
            );
            completed.push(task);
        }

        self.state
            .promote(&plan.to_environment(now), plan.base_plan_id.as_deref())?;
        info!(
            environment = %plan.environment,
            plan_id = %plan.plan_id,
            snapshots = new_snapshots.len(),
            intervals = completed.len(),
            "plan applied"
        );

        Ok(ApplyReport {
            plan_id: plan.plan_id.clone(),
            environment: plan.environment.clone(),
            pushed_snapshots: new_snapshots.len(),
            completed,
            empty_backfill: plan.empty_backfill,
        })
    }
}
