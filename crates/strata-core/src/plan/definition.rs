//! The immutable result of a planning session.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::Serialize;

use crate::environment::{Environment, EnvironmentNamingInfo, TableNaming};
use crate::errors::{StrataError, StrataResult};
use crate::plan::context_diff::ContextDiff;
use crate::plan::deployability::DeployabilityIndex;
use crate::plan::scheduler::{execution_order, EvaluationTask, SnapshotIntervals};
use crate::snapshot::{hash_values, Interval, Snapshot, SnapshotId};
use crate::time::Timestamp;

/// Storage identifiers of one snapshot as seen from the plan's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalTarget {
    pub snapshot_id: SnapshotId,
    /// `None` for units without storage of their own.
    pub physical_table: Option<String>,
    pub view_name: String,
    pub deployable: bool,
}

/// Everything needed to review and apply one deployment.
#[derive(Debug, Clone)]
pub struct Plan {
    pub plan_id: String,
    pub environment: String,
    pub environment_naming: EnvironmentNamingInfo,
    pub context_diff: ContextDiff,
    /// Target snapshot set by name, upstream first.
    pub snapshots: IndexMap<String, Snapshot>,
    /// Snapshots the state store has not seen yet.
    pub new_snapshots: Vec<SnapshotId>,
    pub deployability_index: DeployabilityIndex,
    pub missing_intervals: Vec<SnapshotIntervals>,
    pub restatements: BTreeMap<SnapshotId, Interval>,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub execution_time: Timestamp,
    pub empty_backfill: bool,
    pub forward_only: bool,
    pub is_dev: bool,
    pub base_plan_id: Option<String>,
    /// Expiration assigned to the environment when the plan is applied.
    pub environment_ttl: Option<i64>,
}

impl Plan {
    /// Content hash over everything that affects application, chained to
    /// the base plan id.
    pub(crate) fn compute_id(&self) -> String {
        let mut values: Vec<String> = vec![
            self.environment.clone(),
            self.base_plan_id.clone().unwrap_or_default(),
            self.start.to_string(),
            self.end.map(|end| end.to_string()).unwrap_or_default(),
            self.empty_backfill.to_string(),
            self.forward_only.to_string(),
        ];
        for snapshot in self.snapshots.values() {
            values.push(snapshot.id().to_string());
            values.push(
                snapshot
                    .change_category
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_default(),
            );
        }
        for entry in &self.missing_intervals {
            values.push(entry.snapshot_id.to_string());
            for (start, end) in &entry.intervals {
                values.push(format!("{start}-{end}"));
            }
        }
        for (id, (start, end)) in &self.restatements {
            values.push(format!("restate {id} {start}-{end}"));
        }
        hash_values(values)
    }

    /// Whether the target snapshot set differs from the environment's.
    pub fn has_changes(&self) -> bool {
        self.context_diff.has_changes()
    }

    pub fn requires_backfill(&self) -> bool {
        !self.empty_backfill && !self.missing_intervals.is_empty()
    }

    pub fn new_snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.new_snapshots
            .iter()
            .filter_map(|id| self.snapshots.get(&id.name))
    }

    /// New snapshots still waiting for a category choice.
    pub fn uncategorized(&self) -> Vec<SnapshotId> {
        self.new_snapshots()
            .filter(|snapshot| !snapshot.is_categorized())
            .map(Snapshot::id)
            .collect()
    }

    pub fn ensure_categorized(&self) -> StrataResult<()> {
        let pending = self.uncategorized();
        if pending.is_empty() {
            Ok(())
        } else {
            Err(StrataError::Uncategorized(pending))
        }
    }

    /// Whether the unit's snapshot starts a new storage lineage relative to
    /// the environment.
    pub fn is_new_version(&self, name: &str) -> bool {
        let Some(snapshot) = self.snapshots.get(name) else {
            return false;
        };
        match self.context_diff.previous.get(name) {
            Some(previous) => snapshot.version != previous.version,
            None => true,
        }
    }

    pub fn directly_modified(&self) -> BTreeSet<String> {
        self.context_diff.directly_modified()
    }

    pub fn indirectly_modified(&self) -> BTreeSet<String> {
        self.context_diff.indirectly_modified()
    }

    pub fn execution_order(&self) -> Vec<EvaluationTask> {
        execution_order(&self.missing_intervals, &self.snapshots)
    }

    /// Environment record written when this plan is applied at `now`.
    pub fn to_environment(&self, now: Timestamp) -> Environment {
        Environment {
            name: self.environment.clone(),
            snapshots: self.snapshots.values().map(Snapshot::id).collect(),
            start_at: self.start,
            end_at: self.end,
            plan_id: self.plan_id.clone(),
            previous_plan_id: self.base_plan_id.clone(),
            expiration_ts: self.environment_ttl.map(|ttl| now.saturating_add(ttl)),
            finalized_ts: now,
            suffix_target: self.environment_naming.suffix_target,
        }
    }

    /// Physical table and view name of every target snapshot.
    pub fn physical_targets(&self, naming: &dyn TableNaming) -> Vec<PhysicalTarget> {
        self.snapshots
            .values()
            .map(|snapshot| {
                let deployable = self.deployability_index.is_representative(snapshot);
                PhysicalTarget {
                    snapshot_id: snapshot.id(),
                    physical_table: (!snapshot.is_symbolic())
                        .then(|| naming.physical_table(snapshot, deployable)),
                    view_name: naming.view_name(&snapshot.name, &self.environment_naming),
                    deployable,
                }
            })
            .collect()
    }
}
