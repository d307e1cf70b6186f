//! Comparison of a candidate snapshot set against an environment's recorded
//! set.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use indexmap::IndexMap;

use crate::errors::{StrataError, StrataResult};
use crate::models::ModelDefinition;
use crate::snapshot::{Snapshot, SnapshotId};

/// Fail if any definition depends on a unit that is neither defined locally
/// nor present in the environment.
pub fn check_dependencies<'a>(
    definitions: impl IntoIterator<Item = &'a ModelDefinition>,
    local_names: &HashSet<&str>,
    environment_names: &HashSet<&str>,
    environment: &str,
) -> StrataResult<()> {
    for definition in definitions {
        for dependency in &definition.depends_on {
            let dependency = dependency.as_str();
            if !local_names.contains(dependency) && !environment_names.contains(dependency) {
                return Err(StrataError::InconsistentDiff {
                    model: definition.name.clone(),
                    dependency: dependency.to_string(),
                    environment: environment.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Four disjoint partitions of the union of candidate and environment
/// units, plus the environment state the diff was taken against.
#[derive(Debug, Clone)]
pub struct ContextDiff {
    pub environment: String,
    pub is_new_environment: bool,
    /// Environment the recorded set was read from.
    pub create_from: String,
    /// Plan id of the target environment when the diff was taken.
    pub base_plan_id: Option<String>,
    pub snapshots: IndexMap<String, Snapshot>,
    pub previous: IndexMap<String, Snapshot>,
    pub added: BTreeSet<String>,
    pub removed: BTreeMap<String, SnapshotId>,
    /// Before and after ids.
    pub modified: BTreeMap<String, (SnapshotId, SnapshotId)>,
    pub unmodified: BTreeSet<String>,
}

impl ContextDiff {
    /// Partition `candidates` against `previous`. Neither input is mutated.
    pub fn compute(
        environment: &str,
        create_from: &str,
        is_new_environment: bool,
        base_plan_id: Option<String>,
        candidates: &IndexMap<String, Snapshot>,
        previous: &IndexMap<String, Snapshot>,
    ) -> Self {
        let mut added = BTreeSet::new();
        let mut modified = BTreeMap::new();
        let mut unmodified = BTreeSet::new();
        for (name, candidate) in candidates {
            match previous.get(name) {
                None => {
                    added.insert(name.clone());
                }
                Some(old) if old.id() != candidate.id() => {
                    modified.insert(name.clone(), (old.id(), candidate.id()));
                }
                Some(_) => {
                    unmodified.insert(name.clone());
                }
            }
        }
        let removed = previous
            .iter()
            .filter(|(name, _)| !candidates.contains_key(*name))
            .map(|(name, snapshot)| (name.clone(), snapshot.id()))
            .collect();

        Self {
            environment: environment.to_string(),
            is_new_environment,
            create_from: create_from.to_string(),
            base_plan_id,
            snapshots: candidates.clone(),
            previous: previous.clone(),
            added,
            removed,
            modified,
            unmodified,
        }
    }

    pub fn has_snapshot_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.modified.is_empty()
    }

    /// Snapshot changes, or a target environment that does not exist yet.
    pub fn has_changes(&self) -> bool {
        self.has_snapshot_changes() || self.is_new_environment
    }

    fn own_change(&self, name: &str) -> Option<(bool, bool)> {
        let new = self.snapshots.get(name)?;
        let old = self.previous.get(name)?;
        let data = new.fingerprint.data_hash != old.fingerprint.data_hash;
        let metadata = new.fingerprint.metadata_hash != old.fingerprint.metadata_hash;
        Some((data, metadata))
    }

    /// Modified units whose own definition changed.
    pub fn directly_modified(&self) -> BTreeSet<String> {
        self.modified
            .keys()
            .filter(|name| matches!(self.own_change(name), Some((d, m)) if d || m))
            .cloned()
            .collect()
    }

    /// Modified units that changed only through their parents.
    pub fn indirectly_modified(&self) -> BTreeSet<String> {
        self.modified
            .keys()
            .filter(|name| matches!(self.own_change(name), Some((false, false))))
            .cloned()
            .collect()
    }

    /// Directly modified units whose data hash is unchanged.
    pub fn metadata_updated(&self) -> BTreeSet<String> {
        self.modified
            .keys()
            .filter(|name| matches!(self.own_change(name), Some((false, true))))
            .cloned()
            .collect()
    }

    pub fn is_modified(&self, name: &str) -> bool {
        self.modified.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{full_model, snapshots_for};

    #[test]
    fn test_partitions() {
        let previous = snapshots_for(vec![
            full_model("db.a"),
            full_model("db.b").with_depends_on(["db.a"]),
            full_model("db.gone"),
        ]);
        let candidates = snapshots_for(vec![
            full_model("db.a").with_owner("analytics"),
            full_model("db.b").with_depends_on(["db.a"]),
            full_model("db.new"),
        ]);
        let diff = ContextDiff::compute("prod", "prod", false, None, &candidates, &previous);

        assert_eq!(diff.added, BTreeSet::from(["db.new".to_string()]));
        assert!(diff.removed.contains_key("db.gone"));
        assert_eq!(diff.modified.len(), 2);
        assert!(diff.unmodified.is_empty());
        assert_eq!(diff.directly_modified(), BTreeSet::from(["db.a".to_string()]));
        assert_eq!(diff.metadata_updated(), BTreeSet::from(["db.a".to_string()]));
        assert_eq!(diff.indirectly_modified(), BTreeSet::from(["db.b".to_string()]));
        assert!(diff.has_changes());
    }

    #[test]
    fn test_identical_sets_have_no_changes() {
        let previous = snapshots_for(vec![full_model("db.a")]);
        let diff = ContextDiff::compute("prod", "prod", false, None, &previous, &previous);
        assert!(!diff.has_changes());
        assert_eq!(diff.unmodified.len(), 1);

        let fresh = ContextDiff::compute("dev", "prod", true, None, &previous, &previous);
        assert!(fresh.has_changes());
        assert!(!fresh.has_snapshot_changes());
    }

    #[test]
    fn test_check_dependencies() {
        let definitions = vec![full_model("db.b").with_depends_on(["db.a"])];
        let local: HashSet<&str> = HashSet::from(["db.b"]);
        let env: HashSet<&str> = HashSet::from(["db.a"]);
        assert!(check_dependencies(&definitions, &local, &env, "prod").is_ok());
        match check_dependencies(&definitions, &local, &HashSet::new(), "prod") {
            Err(StrataError::InconsistentDiff { model, dependency, .. }) => {
                assert_eq!(model, "db.b");
                assert_eq!(dependency, "db.a");
            }
            other => panic!("expected inconsistent diff, got {other:?}"),
        }
    }
}
