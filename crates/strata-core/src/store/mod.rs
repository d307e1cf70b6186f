//! State store: persisted snapshots, environments and interval history.

pub mod database;
pub mod janitor;
pub mod memory;
pub mod schema;

use std::collections::HashMap;

use crate::environment::Environment;
use crate::errors::StrataResult;
use crate::snapshot::{Interval, Intervals, Snapshot, SnapshotId};
use crate::time::Timestamp;

pub use database::SqliteStateStore;
pub use janitor::{run_janitor, JanitorReport};
pub use memory::InMemoryStateStore;

/// Read side of the state store.
pub trait StateReader: Send + Sync {
    fn get_environment(&self, name: &str) -> StrataResult<Option<Environment>>;

    fn get_environments(&self) -> StrataResult<Vec<Environment>>;

    /// Stored snapshots for the given ids, with both interval histories
    /// attached. Unknown ids are absent from the result.
    fn get_snapshots(&self, ids: &[SnapshotId]) -> StrataResult<HashMap<SnapshotId, Snapshot>>;

    /// Representative history shared by every snapshot of `name` with the
    /// given revision.
    fn get_representative_intervals(&self, name: &str, revision: &str) -> StrataResult<Intervals>;
}

/// Write side of the state store. Every operation is atomic.
pub trait StateSync: StateReader {
    /// Persist snapshots. Ids that already exist are left untouched.
    fn push_snapshots(&self, snapshots: &[Snapshot]) -> StrataResult<()>;

    /// Record a completed interval. Representative history is shared by
    /// every snapshot with the same name and revision; provisional history
    /// (`is_dev`) belongs to the snapshot alone. Idempotent.
    fn add_interval(&self, snapshot: &Snapshot, interval: Interval, is_dev: bool)
        -> StrataResult<()>;

    /// Forget completeness for `interval` on each snapshot. With `is_dev`
    /// only provisional history is cleared; otherwise both histories are.
    fn remove_interval(
        &self,
        snapshots: &[Snapshot],
        interval: Interval,
        is_dev: bool,
    ) -> StrataResult<()>;

    /// Replace the environment record if its current plan id still equals
    /// `expected_plan_id` (`None` meaning absent or expired). Fails with
    /// `StaleBase` otherwise.
    fn promote(&self, environment: &Environment, expected_plan_id: Option<&str>)
        -> StrataResult<()>;

    /// Mark an environment expired as of `now`. The production environment
    /// is refused.
    fn invalidate_environment(&self, name: &str, now: Timestamp) -> StrataResult<()>;

    /// Delete environments whose expiration has passed and return them.
    fn delete_expired_environments(&self, now: Timestamp) -> StrataResult<Vec<Environment>>;

    /// Snapshots referenced by no live environment and created more than
    /// `ttl` before `now`.
    fn expired_snapshots(&self, now: Timestamp, ttl: i64) -> StrataResult<Vec<SnapshotId>>;

    /// Delete snapshots and any interval history no remaining snapshot uses.
    fn delete_snapshots(&self, ids: &[SnapshotId]) -> StrataResult<()>;

    /// Fold stored interval records into their minimal form.
    fn compact_intervals(&self) -> StrataResult<()> {
        Ok(())
    }
}

/// Plan id of the environment, treating expired environments as absent.
pub(crate) fn live_plan_id(environment: Option<&Environment>, now: Timestamp) -> Option<String> {
    environment
        .filter(|env| !env.is_expired(now))
        .map(|env| env.plan_id.clone())
}
