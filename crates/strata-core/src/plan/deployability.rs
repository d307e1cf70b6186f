//! Which snapshots of a plan may be read as production-equivalent data.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::Dag;
use crate::snapshot::{Snapshot, SnapshotChangeCategory, SnapshotId};
use crate::time::Timestamp;

/// Snapshots whose visible table is provisional rather than representative.
///
/// Anything not listed is deployable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployabilityIndex {
    non_deployable: BTreeSet<SnapshotId>,
}

impl DeployabilityIndex {
    pub fn all_deployable() -> Self {
        Self::default()
    }

    /// Classify the target snapshots of a non-production plan.
    ///
    /// `order` is topological, so a parent is always decided before its
    /// children. `prod` holds the production environment's snapshots by
    /// name; a snapshot identical to its production counterpart is
    /// deployable unless it is `restated`. Restated snapshots are recomputed
    /// into provisional tables so production history stays untouched.
    pub fn compute(
        order: &[String],
        dag: &Dag,
        snapshots: &IndexMap<String, Snapshot>,
        prod: &HashMap<String, Snapshot>,
        restated: &BTreeSet<String>,
        plan_start: Timestamp,
        environment_start: Option<Timestamp>,
    ) -> Self {
        let mut non_deployable: BTreeSet<SnapshotId> = BTreeSet::new();
        let mut blocked: BTreeSet<&str> = BTreeSet::new();

        for name in order {
            let Some(snapshot) = snapshots.get(name) else {
                continue;
            };
            let counterpart = prod.get(name);
            let is_restated = restated.contains(name);
            if !is_restated && counterpart.is_some_and(|p| p.id() == snapshot.id()) {
                continue;
            }

            let parent_blocked = dag
                .parents(name)
                .iter()
                .any(|parent| blocked.contains(parent.as_str()));
            let provisional = is_restated
                || parent_blocked
                || match snapshot.change_category {
                    Some(SnapshotChangeCategory::ForwardOnly) => true,
                    Some(SnapshotChangeCategory::IndirectNonBreaking) => {
                        counterpart.map_or(true, |p| p.revision != snapshot.revision)
                    }
                    _ => false,
                }
                || unaligned_start(snapshot, plan_start, environment_start);

            if provisional {
                debug!(snapshot = %snapshot.id(), restated = is_restated, "not deployable");
                blocked.insert(name.as_str());
                non_deployable.insert(snapshot.id());
            }
        }
        Self { non_deployable }
    }

    pub fn is_deployable(&self, id: &SnapshotId) -> bool {
        !self.non_deployable.contains(id)
    }

    pub fn is_representative(&self, snapshot: &Snapshot) -> bool {
        self.is_deployable(&snapshot.id())
    }

    pub fn non_deployable(&self) -> impl Iterator<Item = &SnapshotId> {
        self.non_deployable.iter()
    }

    pub fn is_all_deployable(&self) -> bool {
        self.non_deployable.is_empty()
    }
}

/// A history-dependent unit cannot be built representatively from a start
/// later than where its history begins.
fn unaligned_start(
    snapshot: &Snapshot,
    plan_start: Timestamp,
    environment_start: Option<Timestamp>,
) -> bool {
    if !snapshot.depends_on_past() || snapshot.is_symbolic() {
        return false;
    }
    let horizon = snapshot
        .node
        .start
        .or_else(|| snapshot.intervals.start())
        .or(environment_start);
    horizon.is_some_and(|horizon| plan_start > horizon)
}
