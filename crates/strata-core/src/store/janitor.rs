//! Reclamation sweep for expired environments and unreferenced snapshots.

use tracing::info;

use crate::config::PlannerConfig;
use crate::errors::StrataResult;
use crate::snapshot::SnapshotId;
use crate::store::StateSync;
use crate::time::Timestamp;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub deleted_environments: Vec<String>,
    pub deleted_snapshots: Vec<SnapshotId>,
}

impl JanitorReport {
    pub fn is_empty(&self) -> bool {
        self.deleted_environments.is_empty() && self.deleted_snapshots.is_empty()
    }
}

/// Delete expired environments, then every snapshot no live environment
/// references that is older than the configured `snapshot_ttl`.
pub fn run_janitor(
    state: &dyn StateSync,
    config: &PlannerConfig,
    now: Timestamp,
) -> StrataResult<JanitorReport> {
    let deleted_environments: Vec<String> = state
        .delete_expired_environments(now)?
        .into_iter()
        .map(|env| env.name)
        .collect();

    let deleted_snapshots = state.expired_snapshots(now, config.snapshot_ttl)?;
    if !deleted_snapshots.is_empty() {
        state.delete_snapshots(&deleted_snapshots)?;
    }
    state.compact_intervals()?;

    info!(
        environments = deleted_environments.len(),
        snapshots = deleted_snapshots.len(),
        "janitor sweep finished"
    );
    Ok(JanitorReport {
        deleted_environments,
        deleted_snapshots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStateStore, SqliteStateStore, StateReader};
    use crate::test_utils::{environment, stored_snapshot};
    use crate::time::DAY_MS;

    fn seed(state: &dyn StateSync) -> (SnapshotId, SnapshotId) {
        let kept = stored_snapshot("db.kept", &["id"]);
        let dropped = stored_snapshot("db.dropped", &["id"]);
        state.push_snapshots(&[kept.clone(), dropped.clone()]).unwrap();
        state
            .promote(&environment("prod", "p", &[kept.id()]), None)
            .unwrap();
        let mut dev = environment("dev", "d", &[dropped.id()]);
        dev.expiration_ts = Some(DAY_MS);
        state.promote(&dev, None).unwrap();
        (kept.id(), dropped.id())
    }

    fn one_day_ttl() -> PlannerConfig {
        PlannerConfig {
            snapshot_ttl: DAY_MS,
            ..PlannerConfig::default()
        }
    }

    #[test]
    fn test_sweep_in_memory() {
        let state = InMemoryStateStore::new();
        let (kept, dropped) = seed(&state);

        let config = one_day_ttl();
        let early = run_janitor(&state, &config, DAY_MS / 2).unwrap();
        assert!(early.is_empty());

        let report = run_janitor(&state, &config, 3 * DAY_MS).unwrap();
        assert_eq!(report.deleted_environments, vec!["dev".to_string()]);
        assert_eq!(report.deleted_snapshots, vec![dropped.clone()]);
        assert_eq!(state.get_snapshots(&[kept, dropped]).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_sqlite() {
        let state = SqliteStateStore::open_in_memory().unwrap();
        let (_, dropped) = seed(&state);
        let report = run_janitor(&state, &one_day_ttl(), 3 * DAY_MS).unwrap();
        assert_eq!(report.deleted_snapshots, vec![dropped]);
        assert_eq!(state.get_environments().unwrap().len(), 1);
    }

    #[test]
    fn test_default_ttl_keeps_recent_snapshots() {
        let state = InMemoryStateStore::new();
        let (_, dropped) = seed(&state);
        let report = run_janitor(&state, &PlannerConfig::default(), 3 * DAY_MS).unwrap();
        assert_eq!(report.deleted_environments, vec!["dev".to_string()]);
        assert!(report.deleted_snapshots.is_empty());
        assert_eq!(state.get_snapshots(&[dropped]).unwrap().len(), 1);
    }
}
