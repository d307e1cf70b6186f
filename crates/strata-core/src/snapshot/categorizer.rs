//! Change categorization: auto-inference for direct changes and propagation
//! of categories down the dependency graph.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::Dag;
use crate::models::{Computation, ModelDefinition, Projection};
use crate::snapshot::definition::{Snapshot, SnapshotChangeCategory};

/// How far auto-inference may go for one family of computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoCategorizationMode {
    /// Infer both breaking and non-breaking outcomes.
    Full,
    /// Only auto-accept non-breaking outcomes.
    Semi,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizerConfig {
    pub sql: AutoCategorizationMode,
    pub opaque: AutoCategorizationMode,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            sql: AutoCategorizationMode::Full,
            opaque: AutoCategorizationMode::Off,
        }
    }
}

impl CategorizerConfig {
    pub fn mode_for(&self, computation: &Computation) -> AutoCategorizationMode {
        if computation.is_sql() {
            self.sql
        } else {
            self.opaque
        }
    }
}

/// Whether `old` survives in `new` unchanged and in order, with only
/// insertions around it.
fn is_additive(old: &[Projection], new: &[Projection]) -> bool {
    let mut remaining = new.iter();
    old.iter().all(|kept| remaining.any(|candidate| candidate == kept))
}

fn infer(new: &ModelDefinition, old: &ModelDefinition) -> Option<SnapshotChangeCategory> {
    if new.kind != old.kind
        || new.partitioned_by != old.partitioned_by
        || new.depends_on_self != old.depends_on_self
    {
        return Some(SnapshotChangeCategory::Breaking);
    }
    match (&new.computation, &old.computation) {
        (
            Computation::Sql {
                projections: new_projections,
                body: new_body,
            },
            Computation::Sql {
                projections: old_projections,
                body: old_body,
            },
        ) => {
            if new_body != old_body || !is_additive(old_projections, new_projections) {
                Some(SnapshotChangeCategory::Breaking)
            } else {
                Some(SnapshotChangeCategory::NonBreaking)
            }
        }
        (Computation::Opaque { source: new_source }, Computation::Opaque { source: old_source }) => {
            (new_source == old_source).then_some(SnapshotChangeCategory::NonBreaking)
        }
        _ => Some(SnapshotChangeCategory::Breaking),
    }
}

/// Infer the category of a direct data change from `old` to `new`.
///
/// Returns `None` when the configured mode does not allow a decision.
pub fn categorize_change(
    new: &ModelDefinition,
    old: &ModelDefinition,
    config: &CategorizerConfig,
) -> Option<SnapshotChangeCategory> {
    match config.mode_for(&new.computation) {
        AutoCategorizationMode::Off => None,
        AutoCategorizationMode::Semi => {
            infer(new, old).filter(|c| *c == SnapshotChangeCategory::NonBreaking)
        }
        AutoCategorizationMode::Full => infer(new, old),
    }
}

/// Category of a unit whose only data change comes from changed parents.
fn indirect_category(
    node: &ModelDefinition,
    parent_categories: &[Option<SnapshotChangeCategory>],
) -> Option<SnapshotChangeCategory> {
    use SnapshotChangeCategory::*;

    if node.is_forward_only() || parent_categories.contains(&Some(ForwardOnly)) {
        return Some(ForwardOnly);
    }
    if parent_categories.contains(&None) {
        return None;
    }
    let any = |wanted: &[SnapshotChangeCategory]| {
        parent_categories
            .iter()
            .flatten()
            .any(|category| wanted.contains(category))
    };
    if any(&[Breaking, IndirectBreaking]) {
        Some(IndirectBreaking)
    } else if any(&[NonBreaking, IndirectNonBreaking]) {
        Some(IndirectNonBreaking)
    } else {
        Some(Metadata)
    }
}

/// Assigns categories to new snapshots, upstream first.
///
/// Every call recomputes from the inputs, so retracting a manual choice
/// retracts everything that followed from it.
pub struct Categorizer<'a> {
    pub config: &'a CategorizerConfig,
    pub choices: &'a HashMap<String, SnapshotChangeCategory>,
    pub forward_only_plan: bool,
}

impl Categorizer<'_> {
    /// Categorize the snapshots named in `pending`, walking `dag` in
    /// topological order. `previous` holds the target environment's snapshots
    /// by name.
    pub fn run(
        &self,
        order: &[String],
        dag: &Dag,
        snapshots: &mut IndexMap<String, Snapshot>,
        previous: &HashMap<String, Snapshot>,
        pending: &HashSet<String>,
    ) {
        for name in order {
            if !pending.contains(name) {
                continue;
            }
            let parent_categories: Vec<Option<SnapshotChangeCategory>> = dag
                .parents(name)
                .iter()
                .filter_map(|parent| snapshots.get(parent))
                .filter(|parent| {
                    previous
                        .get(&parent.name)
                        .map_or(true, |old| old.id() != parent.id())
                })
                .map(|parent| parent.change_category)
                .collect();

            let Some(snapshot) = snapshots.get_mut(name) else {
                continue;
            };
            let old = previous.get(name);
            let category = self.decide(snapshot, old, &parent_categories);
            match category {
                Some(category) => snapshot.categorize_as(category, old),
                None => snapshot.uncategorize(),
            }
            debug!(
                snapshot = %snapshot.id(),
                category = ?snapshot.change_category,
                "categorized"
            );
        }
    }

    fn decide(
        &self,
        snapshot: &Snapshot,
        old: Option<&Snapshot>,
        parent_categories: &[Option<SnapshotChangeCategory>],
    ) -> Option<SnapshotChangeCategory> {
        let Some(old) = old else {
            return Some(SnapshotChangeCategory::Breaking);
        };

        if snapshot.fingerprint.data_hash != old.fingerprint.data_hash {
            if let Some(choice) = self.choices.get(&snapshot.name) {
                return Some(*choice);
            }
            if snapshot.node.is_forward_only()
                || self.forward_only_plan
                || parent_categories.contains(&Some(SnapshotChangeCategory::ForwardOnly))
            {
                return Some(SnapshotChangeCategory::ForwardOnly);
            }
            // Breaking upstream changes propagate to directly changed units.
            if parent_categories
                .iter()
                .any(|category| category.is_some_and(SnapshotChangeCategory::is_breaking))
            {
                return Some(SnapshotChangeCategory::Breaking);
            }
            return categorize_change(&snapshot.node, &old.node, self.config);
        }

        if !parent_categories.is_empty() {
            return indirect_category(&snapshot.node, parent_categories);
        }
        Some(SnapshotChangeCategory::Metadata)
    }
}
