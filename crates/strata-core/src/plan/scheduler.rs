//! Missing-interval computation, restatement expansion and execution order.
//!
//! Everything here is a pure function of the snapshots, their recorded
//! history and an injected `now`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::Dag;
use crate::errors::StrataResult;
use crate::plan::deployability::DeployabilityIndex;
use crate::snapshot::{Interval, Snapshot, SnapshotId};
use crate::time::{IntervalUnit, Timestamp};

/// Buckets of one snapshot that still need computing, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIntervals {
    pub snapshot_id: SnapshotId,
    pub intervals: Vec<Interval>,
    /// Whether the buckets are recorded as representative history.
    pub deployable: bool,
}

impl SnapshotIntervals {
    pub fn start(&self) -> Option<Timestamp> {
        self.intervals.first().map(|(start, _)| *start)
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.intervals.last().map(|(_, end)| *end)
    }
}

/// One bucket of one snapshot, ready to hand to an evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluationTask {
    pub snapshot_id: SnapshotId,
    pub interval: Interval,
    pub deployable: bool,
}

/// Bucket granularity and the end of the last fully elapsed bucket.
pub(crate) fn schedule_bounds(
    snapshot: &Snapshot,
    now: Timestamp,
) -> StrataResult<(IntervalUnit, Timestamp)> {
    let schedule = snapshot.node.schedule()?;
    Ok((schedule.interval_unit(), schedule.eligible_end(now)?))
}

/// Start of the most recent fully elapsed bucket.
pub(crate) fn latest_bucket_start(snapshot: &Snapshot, now: Timestamp) -> StrataResult<Timestamp> {
    let (unit, eligible_end) = schedule_bounds(snapshot, now)?;
    Ok(unit.prev(eligible_end))
}

/// Inputs shared by every snapshot of one missing-interval computation.
pub struct IntervalScheduler<'a> {
    pub snapshots: &'a IndexMap<String, Snapshot>,
    pub dag: &'a Dag,
    pub deployability: &'a DeployabilityIndex,
    /// Names whose snapshot differs from the one the environment holds.
    pub changed: &'a HashSet<String>,
    /// Units allowed to backfill; `None` means all of them.
    pub backfill: Option<&'a BTreeSet<String>>,
    /// Restated range per unit name.
    pub restatements: &'a BTreeMap<String, Interval>,
    /// Only restated units are scheduled, inside their restated range.
    pub restatement_only: bool,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub explicit_end: bool,
    pub now: Timestamp,
    pub is_dev: bool,
    pub enable_preview: bool,
}

impl IntervalScheduler<'_> {
    /// Missing buckets of every schedulable snapshot, sorted by snapshot id.
    pub fn missing_intervals(&self) -> StrataResult<Vec<SnapshotIntervals>> {
        let mut result = Vec::new();
        for (name, snapshot) in self.snapshots {
            if snapshot.is_symbolic() || !snapshot.is_categorized() {
                continue;
            }
            if self.backfill.is_some_and(|allowed| !allowed.contains(name)) {
                continue;
            }
            let deployable = self.deployability.is_representative(snapshot);
            let restated = self.restatements.get(name).copied();
            if self.is_dev && !self.enable_preview && !deployable && restated.is_none() {
                continue;
            }
            if self.restatement_only && restated.is_none() {
                continue;
            }

            let intervals = self.missing_for(snapshot, deployable, restated)?;
            if !intervals.is_empty() {
                debug!(
                    snapshot = %snapshot.id(),
                    count = intervals.len(),
                    deployable,
                    "missing intervals"
                );
                result.push(SnapshotIntervals {
                    snapshot_id: snapshot.id(),
                    intervals,
                    deployable,
                });
            }
        }
        result.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        Ok(result)
    }

    fn window_end(
        &self,
        snapshot: &Snapshot,
        unit: IntervalUnit,
        eligible: Timestamp,
    ) -> StrataResult<Timestamp> {
        let mut end = eligible;
        if let Some(bound) = self.end {
            end = end.min(bound);
        }
        if let Some(bound) = snapshot.node.end {
            end = end.min(bound);
        }
        for parent in self.dag.parents(&snapshot.name) {
            let Some(parent) = self.snapshots.get(parent) else {
                continue;
            };
            let (parent_unit, parent_eligible) = schedule_bounds(parent, self.now)?;
            if parent_unit.is_coarser_than(unit) {
                end = end.min(parent_eligible);
            }
        }
        Ok(end)
    }

    fn missing_for(
        &self,
        snapshot: &Snapshot,
        deployable: bool,
        restated: Option<Interval>,
    ) -> StrataResult<Vec<Interval>> {
        let (unit, eligible) = schedule_bounds(snapshot, self.now)?;
        let changed = self.changed.contains(&snapshot.name);
        let history = snapshot.history(deployable);

        let mut start = self.start.max(snapshot.node.start.unwrap_or(Timestamp::MIN));
        let mut end = self.window_end(snapshot, unit, eligible)?;
        if self.restatement_only {
            if let Some((restated_start, restated_end)) = restated {
                start = restated_start.max(snapshot.node.start.unwrap_or(Timestamp::MIN));
                end = end.min(restated_end);
            }
        } else if self.is_dev && !self.explicit_end && !changed {
            if let Some(recorded_end) = history.end() {
                end = end.min(recorded_end);
            }
        }

        let buckets = unit.buckets(unit.ceil(start), end);
        if buckets.is_empty() {
            return Ok(Vec::new());
        }

        let mut covered = history.clone();
        if changed && deployable && snapshot.is_forward_only() {
            if let Some(cutover) = snapshot.effective_from {
                covered = covered.without((cutover, Timestamp::MAX));
            }
        }
        if let Some(range) = restated {
            covered = covered.without(range);
        }

        let gaps: Vec<bool> = buckets.iter().map(|bucket| !covered.covers(*bucket)).collect();
        let mut missing = gaps.clone();
        let lookback = snapshot.node.lookback as usize;
        if lookback > 0 {
            for (index, gap) in gaps.iter().enumerate() {
                if *gap {
                    for slot in &mut missing[index.saturating_sub(lookback)..index] {
                        *slot = true;
                    }
                }
            }
        }
        if snapshot.depends_on_past() {
            if let Some(first) = missing.iter().position(|m| *m) {
                for slot in &mut missing[first..] {
                    *slot = true;
                }
            }
        }

        Ok(buckets
            .into_iter()
            .zip(missing)
            .filter_map(|(bucket, missing)| missing.then_some(bucket))
            .collect())
    }
}

/// Widen requested restatements to what each unit's kind requires.
///
/// With `downstream` set, every transitive dependent of a restated unit is
/// restated over the same range. Full-history kinds restate their whole
/// history; other history-dependent kinds restate through the eligible end.
/// Overlapping requests for one unit collapse to their hull.
pub fn expand_restatements(
    requested: &[(String, Interval)],
    snapshots: &IndexMap<String, Snapshot>,
    dag: &Dag,
    downstream: bool,
    now: Timestamp,
) -> StrataResult<BTreeMap<String, Interval>> {
    let mut expanded: BTreeMap<String, Interval> = BTreeMap::new();
    let mut widen = |name: &str, (start, end): Interval| {
        expanded
            .entry(name.to_string())
            .and_modify(|(s, e)| {
                *s = (*s).min(start);
                *e = (*e).max(end);
            })
            .or_insert((start, end));
    };

    for (name, range) in requested {
        widen(name, *range);
        if downstream {
            for child in dag.downstream(name) {
                widen(&child, *range);
            }
        }
    }

    let mut result = BTreeMap::new();
    for (name, (mut start, mut end)) in expanded {
        let Some(snapshot) = snapshots.get(&name) else {
            continue;
        };
        if snapshot.is_symbolic() {
            continue;
        }
        let (_, eligible) = schedule_bounds(snapshot, now)?;
        if snapshot.node.capabilities().full_history_restatement {
            start = snapshot
                .node
                .start
                .or_else(|| snapshot.intervals.start())
                .unwrap_or(start)
                .min(start);
            end = eligible;
        } else if snapshot.depends_on_past() {
            end = eligible;
        }
        end = end.min(eligible);
        if start < end {
            result.insert(name, (start, end));
        }
    }
    Ok(result)
}

/// Order every missing bucket so each runs after the buckets it reads.
///
/// A bucket of a history-dependent unit waits for its predecessor; a child
/// bucket waits for every overlapping bucket of its parents. Ready tasks run
/// oldest first, ties broken by snapshot id.
pub fn execution_order(
    missing: &[SnapshotIntervals],
    snapshots: &IndexMap<String, Snapshot>,
) -> Vec<EvaluationTask> {
    let tasks: Vec<EvaluationTask> = missing
        .iter()
        .flat_map(|entry| {
            entry.intervals.iter().map(|interval| EvaluationTask {
                snapshot_id: entry.snapshot_id.clone(),
                interval: *interval,
                deployable: entry.deployable,
            })
        })
        .collect();

    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, task) in tasks.iter().enumerate() {
        by_name.entry(task.snapshot_id.name.as_str()).or_default().push(index);
    }

    let mut waiting_on: Vec<usize> = vec![0; tasks.len()];
    let mut unlocks: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (index, task) in tasks.iter().enumerate() {
        let Some(snapshot) = snapshots.get(&task.snapshot_id.name) else {
            continue;
        };
        let mut blockers: BTreeSet<usize> = BTreeSet::new();
        if snapshot.depends_on_past() {
            let previous = by_name.get(task.snapshot_id.name.as_str()).and_then(|same| {
                same.iter()
                    .rev()
                    .find(|other| tasks[**other].interval.1 <= task.interval.0)
            });
            if let Some(previous) = previous {
                blockers.insert(*previous);
            }
        }
        for parent in &snapshot.node.depends_on {
            for other in by_name.get(parent.as_str()).into_iter().flatten() {
                let (start, end) = tasks[*other].interval;
                if start < task.interval.1 && task.interval.0 < end {
                    blockers.insert(*other);
                }
            }
        }
        waiting_on[index] = blockers.len();
        for blocker in blockers {
            unlocks[blocker].push(index);
        }
    }

    let key = |index: usize| (tasks[index].interval.0, tasks[index].snapshot_id.clone(), index);
    let mut ready: BTreeSet<(Timestamp, SnapshotId, usize)> = (0..tasks.len())
        .filter(|index| waiting_on[*index] == 0)
        .map(key)
        .collect();

    let mut ordered = Vec::with_capacity(tasks.len());
    while let Some(next) = ready.pop_first() {
        let index = next.2;
        ordered.push(tasks[index].clone());
        for child in &unlocks[index] {
            waiting_on[*child] -= 1;
            if waiting_on[*child] == 0 {
                ready.insert(key(*child));
            }
        }
    }
    ordered
}
