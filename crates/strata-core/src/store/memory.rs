//! In-process state store guarded by a single mutex.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DEFAULT_PROD_ENVIRONMENT;
use crate::environment::Environment;
use crate::errors::{StrataError, StrataResult};
use crate::snapshot::{Interval, Intervals, Snapshot, SnapshotId};
use crate::store::{live_plan_id, StateReader, StateSync};
use crate::time::Timestamp;

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    environments: BTreeMap<String, Environment>,
    /// Representative history keyed by (name, revision).
    intervals: HashMap<(String, String), Intervals>,
    dev_intervals: HashMap<SnapshotId, Intervals>,
}

impl MemoryState {
    fn hydrate(&self, snapshot: &Snapshot) -> Snapshot {
        let mut hydrated = snapshot.clone();
        let key = (snapshot.name.clone(), snapshot.storage_revision());
        hydrated.intervals = self.intervals.get(&key).cloned().unwrap_or_default();
        hydrated.dev_intervals = self
            .dev_intervals
            .get(&snapshot.id())
            .cloned()
            .unwrap_or_default();
        hydrated
    }
}

/// State store kept in memory; every operation runs in one critical section.
#[derive(Debug)]
pub struct InMemoryStateStore {
    state: Mutex<MemoryState>,
    prod_environment: String,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            prod_environment: DEFAULT_PROD_ENVIRONMENT.to_string(),
        }
    }

    pub fn with_prod_environment(mut self, name: &str) -> Self {
        self.prod_environment = name.to_string();
        self
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }
}

impl StateReader for InMemoryStateStore {
    fn get_environment(&self, name: &str) -> StrataResult<Option<Environment>> {
        Ok(self.state.lock().environments.get(name).cloned())
    }

    fn get_environments(&self) -> StrataResult<Vec<Environment>> {
        Ok(self.state.lock().environments.values().cloned().collect())
    }

    fn get_snapshots(&self, ids: &[SnapshotId]) -> StrataResult<HashMap<SnapshotId, Snapshot>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.snapshots.get(id))
            .map(|snapshot| (snapshot.id(), state.hydrate(snapshot)))
            .collect())
    }

    fn get_representative_intervals(&self, name: &str, revision: &str) -> StrataResult<Intervals> {
        let key = (name.to_string(), revision.to_string());
        Ok(self
            .state
            .lock()
            .intervals
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}

impl StateSync for InMemoryStateStore {
    fn push_snapshots(&self, snapshots: &[Snapshot]) -> StrataResult<()> {
        let mut state = self.state.lock();
        for snapshot in snapshots {
            state
                .snapshots
                .entry(snapshot.id())
                .or_insert_with(|| snapshot.without_intervals());
        }
        debug!(count = snapshots.len(), "pushed snapshots");
        Ok(())
    }

    fn add_interval(
        &self,
        snapshot: &Snapshot,
        interval: Interval,
        is_dev: bool,
    ) -> StrataResult<()> {
        let mut state = self.state.lock();
        if is_dev {
            state
                .dev_intervals
                .entry(snapshot.id())
                .or_default()
                .add(interval);
        } else {
            state
                .intervals
                .entry((snapshot.name.clone(), snapshot.storage_revision()))
                .or_default()
                .add(interval);
        }
        Ok(())
    }

    fn remove_interval(
        &self,
        snapshots: &[Snapshot],
        interval: Interval,
        is_dev: bool,
    ) -> StrataResult<()> {
        let mut state = self.state.lock();
        for snapshot in snapshots {
            if !is_dev {
                let key = (snapshot.name.clone(), snapshot.storage_revision());
                if let Some(history) = state.intervals.get_mut(&key) {
                    history.remove(interval);
                }
            }
            if let Some(history) = state.dev_intervals.get_mut(&snapshot.id()) {
                history.remove(interval);
            }
        }
        Ok(())
    }

    fn promote(
        &self,
        environment: &Environment,
        expected_plan_id: Option<&str>,
    ) -> StrataResult<()> {
        let mut state = self.state.lock();
        let found = live_plan_id(
            state.environments.get(&environment.name),
            environment.finalized_ts,
        );
        if found.as_deref() != expected_plan_id {
            return Err(StrataError::StaleBase {
                environment: environment.name.clone(),
                expected: expected_plan_id.map(str::to_string),
                found,
            });
        }
        state
            .environments
            .insert(environment.name.clone(), environment.clone());
        debug!(environment = %environment.name, plan_id = %environment.plan_id, "promoted");
        Ok(())
    }

    fn invalidate_environment(&self, name: &str, now: Timestamp) -> StrataResult<()> {
        if name == self.prod_environment {
            return Err(StrataError::ProtectedEnvironment(name.to_string()));
        }
        if let Some(environment) = self.state.lock().environments.get_mut(name) {
            environment.expiration_ts = Some(now);
        }
        Ok(())
    }

    fn delete_expired_environments(&self, now: Timestamp) -> StrataResult<Vec<Environment>> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .environments
            .values()
            .filter(|env| env.is_expired(now))
            .map(|env| env.name.clone())
            .collect();
        Ok(expired
            .iter()
            .filter_map(|name| state.environments.remove(name))
            .collect())
    }

    fn expired_snapshots(&self, now: Timestamp, ttl: i64) -> StrataResult<Vec<SnapshotId>> {
        let state = self.state.lock();
        let referenced: HashSet<&SnapshotId> = state
            .environments
            .values()
            .filter(|env| !env.is_expired(now))
            .flat_map(|env| env.snapshots.iter())
            .collect();
        Ok(state
            .snapshots
            .iter()
            .filter(|(id, snapshot)| {
                !referenced.contains(id) && snapshot.created_ts.saturating_add(ttl) <= now
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn delete_snapshots(&self, ids: &[SnapshotId]) -> StrataResult<()> {
        let mut state = self.state.lock();
        for id in ids {
            state.snapshots.remove(id);
            state.dev_intervals.remove(id);
        }
        let live: HashSet<(String, String)> = state
            .snapshots
            .values()
            .map(|s| (s.name.clone(), s.storage_revision()))
            .collect();
        state.intervals.retain(|key, _| live.contains(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{environment, stored_snapshot};

    #[test]
    fn test_shared_revision_history() {
        let store = InMemoryStateStore::new();
        let a = stored_snapshot("db.a", &["id"]);
        let mut b = stored_snapshot("db.a", &["id", "x"]);
        b.revision = a.revision.clone();
        store.push_snapshots(&[a.clone(), b.clone()]).unwrap();
        store.add_interval(&a, (0, 10), false).unwrap();
        store.add_interval(&b, (10, 20), false).unwrap();
        store.add_interval(&b, (10, 20), false).unwrap();
        store.add_interval(&b, (50, 60), true).unwrap();

        let loaded = store.get_snapshots(&[a.id(), b.id()]).unwrap();
        assert_eq!(loaded[&a.id()].intervals.as_slice(), &[(0, 20)]);
        assert!(loaded[&a.id()].dev_intervals.is_empty());
        assert_eq!(loaded[&b.id()].dev_intervals.as_slice(), &[(50, 60)]);

        store.remove_interval(&[b.clone()], (5, 55), false).unwrap();
        let loaded = store.get_snapshots(&[b.id()]).unwrap();
        assert_eq!(loaded[&b.id()].intervals.as_slice(), &[(0, 5)]);
        assert_eq!(loaded[&b.id()].dev_intervals.as_slice(), &[(55, 60)]);
    }

    #[test]
    fn test_dev_removal_keeps_shared_history() {
        let store = InMemoryStateStore::new();
        let a = stored_snapshot("db.a", &["id"]);
        store.push_snapshots(&[a.clone()]).unwrap();
        store.add_interval(&a, (0, 100), false).unwrap();
        store.add_interval(&a, (0, 100), true).unwrap();

        store.remove_interval(&[a.clone()], (40, 60), true).unwrap();
        let loaded = store.get_snapshots(&[a.id()]).unwrap();
        assert_eq!(loaded[&a.id()].intervals.as_slice(), &[(0, 100)]);
        assert_eq!(
            loaded[&a.id()].dev_intervals.as_slice(),
            &[(0, 40), (60, 100)]
        );
    }

    #[test]
    fn test_promote_compare_and_set() {
        let store = InMemoryStateStore::new();
        let first = environment("dev", "plan-1", &[]);
        store.promote(&first, None).unwrap();

        let second = environment("dev", "plan-2", &[]);
        match store.promote(&second, None) {
            Err(StrataError::StaleBase { found, .. }) => {
                assert_eq!(found.as_deref(), Some("plan-1"));
            }
            other => panic!("expected stale base, got {other:?}"),
        }
        store.promote(&second, Some("plan-1")).unwrap();
        assert_eq!(
            store.get_environment("dev").unwrap().unwrap().plan_id,
            "plan-2"
        );
    }

    #[test]
    fn test_prod_cannot_be_invalidated() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.invalidate_environment("prod", 0),
            Err(StrataError::ProtectedEnvironment(_))
        ));
        store.promote(&environment("dev", "p", &[]), None).unwrap();
        store.invalidate_environment("dev", 5).unwrap();
        let removed = store.delete_expired_environments(5).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_environments().unwrap().is_empty());
    }

    #[test]
    fn test_expired_snapshots_skip_referenced() {
        let store = InMemoryStateStore::new();
        let kept = stored_snapshot("db.kept", &["id"]);
        let orphan = stored_snapshot("db.orphan", &["id"]);
        store.push_snapshots(&[kept.clone(), orphan.clone()]).unwrap();
        store.add_interval(&orphan, (0, 10), false).unwrap();
        store
            .promote(&environment("prod", "p", &[kept.id()]), None)
            .unwrap();

        assert!(store.expired_snapshots(10, 100).unwrap().is_empty());
        let expired = store.expired_snapshots(1_000, 100).unwrap();
        assert_eq!(expired, vec![orphan.id()]);

        store.delete_snapshots(&expired).unwrap();
        assert_eq!(store.snapshot_count(), 1);
        store.push_snapshots(&[orphan.clone()]).unwrap();
        let reloaded = store.get_snapshots(&[orphan.id()]).unwrap();
        assert!(reloaded[&orphan.id()].intervals.is_empty());
    }
}
