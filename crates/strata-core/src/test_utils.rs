//! Fixtures shared by unit tests.

use std::collections::HashMap;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::dag::Dag;
use crate::environment::{Environment, EnvironmentSuffixTarget};
use crate::errors::{StrataError, StrataResult};
use crate::models::{Computation, ModelDefinition, ModelKind, Projection};
use crate::plan::{ApplyReport, EvaluationTask, Plan, PlanApplier, SnapshotEvaluator};
use crate::snapshot::{
    fingerprint_all, fingerprint_model, Interval, Snapshot, SnapshotChangeCategory, SnapshotId,
};
use crate::store::StateSync;
use crate::time::{parse_time, Timestamp};

pub fn ts(value: &str) -> Timestamp {
    parse_time(value, 0).unwrap()
}

fn projections(columns: &[&str]) -> Vec<Projection> {
    columns.iter().map(|c| Projection::new(c, c)).collect()
}

/// Daily incremental-by-time model selecting `columns` from `raw.<name>`.
pub fn sql_model(name: &str, columns: &[&str]) -> ModelDefinition {
    ModelDefinition::new(
        name,
        ModelKind::IncrementalByTimeRange {
            time_column: "ds".to_string(),
        },
        Computation::sql(projections(columns), &format!("FROM raw.{name}")),
    )
}

pub fn full_model(name: &str) -> ModelDefinition {
    ModelDefinition::new(
        name,
        ModelKind::Full,
        Computation::sql(projections(&["id"]), &format!("FROM raw.{name}")),
    )
}

/// Fingerprinted snapshot without parents, categorized as a first version.
pub fn stored_snapshot(name: &str, columns: &[&str]) -> Snapshot {
    let node = sql_model(name, columns);
    let fingerprint = fingerprint_model(&node, &HashMap::new()).unwrap();
    let mut snapshot = Snapshot::new(node, fingerprint, Vec::new(), 0);
    snapshot.categorize_as(SnapshotChangeCategory::Breaking, None);
    snapshot
}

/// Categorized first-version snapshots for a self-contained set of
/// definitions, upstream first.
pub fn snapshots_for(definitions: Vec<ModelDefinition>) -> IndexMap<String, Snapshot> {
    let mut dag = Dag::new();
    for definition in &definitions {
        dag.add(&definition.name, &definition.depends_on);
    }
    let by_name: IndexMap<String, ModelDefinition> = definitions
        .into_iter()
        .map(|definition| (definition.name.clone(), definition))
        .collect();
    let fingerprints = fingerprint_all(&dag, &by_name, &HashMap::new()).unwrap();

    let mut snapshots: IndexMap<String, Snapshot> = IndexMap::new();
    for name in dag.sorted().unwrap() {
        let Some(definition) = by_name.get(&name) else {
            continue;
        };
        let parents = definition
            .depends_on
            .iter()
            .filter_map(|dep| snapshots.get(dep).map(Snapshot::id))
            .collect();
        let mut snapshot =
            Snapshot::new(definition.clone(), fingerprints[&name].clone(), parents, 0);
        snapshot.categorize_as(SnapshotChangeCategory::Breaking, None);
        snapshots.insert(name, snapshot);
    }
    snapshots
}

pub fn environment(name: &str, plan_id: &str, snapshots: &[SnapshotId]) -> Environment {
    Environment {
        name: name.to_string(),
        snapshots: snapshots.to_vec(),
        start_at: 0,
        end_at: None,
        plan_id: plan_id.to_string(),
        previous_plan_id: None,
        expiration_ts: None,
        finalized_ts: 0,
        suffix_target: EnvironmentSuffixTarget::default(),
    }
}

/// Evaluator that records every call and optionally fails for one model.
#[derive(Debug, Default)]
pub struct RecordingEvaluator {
    pub calls: Mutex<Vec<EvaluationTask>>,
    pub fail_on: Option<String>,
}

impl RecordingEvaluator {
    pub fn failing_on(name: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(name.to_string()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl SnapshotEvaluator for RecordingEvaluator {
    fn evaluate(
        &self,
        snapshot: &Snapshot,
        interval: Interval,
        deployable: bool,
    ) -> StrataResult<()> {
        if self.fail_on.as_deref() == Some(snapshot.name.as_str()) {
            return Err(StrataError::Evaluation {
                snapshot: snapshot.id(),
                reason: "boom".to_string(),
            });
        }
        self.calls.lock().push(EvaluationTask {
            snapshot_id: snapshot.id(),
            interval,
            deployable,
        });
        Ok(())
    }
}

pub fn apply(state: &dyn StateSync, plan: &Plan, now: Timestamp) -> ApplyReport {
    PlanApplier::new(state)
        .apply(plan, &RecordingEvaluator::default(), now)
        .unwrap()
}
