//! SQLite-backed state store.
//!
//! Interval history is append-only: every add or removal is one record and
//! the current history is folded from the records in write order. Every
//! read-modify-write runs inside a `BEGIN IMMEDIATE` transaction so
//! concurrent writers to the same database file serialize.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::config::DEFAULT_PROD_ENVIRONMENT;
use crate::environment::Environment;
use crate::errors::{StrataError, StrataResult};
use crate::snapshot::{Interval, Intervals, Snapshot, SnapshotId};
use crate::store::schema;
use crate::store::{live_plan_id, StateReader, StateSync};
use crate::time::Timestamp;

fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Fold `(start, end, is_removed)` records, oldest first.
fn fold_records(records: impl IntoIterator<Item = (Timestamp, Timestamp, bool)>) -> Intervals {
    let mut intervals = Intervals::new();
    for (start, end, is_removed) in records {
        if is_removed {
            intervals.remove((start, end));
        } else {
            intervals.add((start, end));
        }
    }
    intervals
}

fn representative_history(
    conn: &Connection,
    name: &str,
    revision: &str,
) -> StrataResult<Intervals> {
    let mut stmt = conn.prepare_cached(
        "SELECT start_ts, end_ts, is_removed FROM _intervals \
         WHERE name = ?1 AND revision = ?2 AND is_dev = 0 ORDER BY id;",
    )?;
    let rows = stmt.query_map(params![name, revision], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, bool>(2)?,
        ))
    })?;
    Ok(fold_records(rows.collect::<Result<Vec<_>, _>>()?))
}

fn dev_history(conn: &Connection, id: &SnapshotId) -> StrataResult<Intervals> {
    let mut stmt = conn.prepare_cached(
        "SELECT start_ts, end_ts, is_removed FROM _intervals \
         WHERE name = ?1 AND identifier = ?2 AND is_dev = 1 ORDER BY id;",
    )?;
    let rows = stmt.query_map(params![id.name, id.identifier], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, bool>(2)?,
        ))
    })?;
    Ok(fold_records(rows.collect::<Result<Vec<_>, _>>()?))
}

fn insert_record(
    conn: &Connection,
    snapshot: &Snapshot,
    (start, end): Interval,
    is_dev: bool,
    is_removed: bool,
) -> StrataResult<()> {
    conn.execute(
        "INSERT INTO _intervals \
         (name, identifier, revision, start_ts, end_ts, is_dev, is_removed, created_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            snapshot.name,
            snapshot.fingerprint.identifier(),
            snapshot.storage_revision(),
            start,
            end,
            is_dev,
            is_removed,
            now_ms()
        ],
    )?;
    Ok(())
}

fn load_environment(conn: &Connection, name: &str) -> StrataResult<Option<Environment>> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM _environments WHERE name = ?1;",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    payload
        .map(|raw| serde_json::from_str(&raw).map_err(StrataError::from))
        .transpose()
}

fn load_environments(conn: &Connection) -> StrataResult<Vec<Environment>> {
    let mut stmt = conn.prepare("SELECT payload FROM _environments ORDER BY name;")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut environments = Vec::new();
    for raw in rows {
        environments.push(serde_json::from_str(&raw?)?);
    }
    Ok(environments)
}

fn save_environment(conn: &Connection, environment: &Environment) -> StrataResult<()> {
    conn.execute(
        "INSERT INTO _environments (name, plan_id, expiration_ts, payload) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(name) DO UPDATE SET \
             plan_id = excluded.plan_id, \
             expiration_ts = excluded.expiration_ts, \
             payload = excluded.payload;",
        params![
            environment.name,
            environment.plan_id,
            environment.expiration_ts,
            serde_json::to_string(environment)?
        ],
    )?;
    Ok(())
}

/// State store persisted in a SQLite database.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    prod_environment: String,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> StrataResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
            prod_environment: DEFAULT_PROD_ENVIRONMENT.to_string(),
        })
    }

    pub fn open_in_memory() -> StrataResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
            prod_environment: DEFAULT_PROD_ENVIRONMENT.to_string(),
        })
    }

    pub fn with_prod_environment(mut self, name: &str) -> Self {
        self.prod_environment = name.to_string();
        self
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Set WAL mode, create all tables and indexes, then run pending
    /// migrations.
    fn init_schema(conn: &Connection) -> StrataResult<()> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(conn)?;
        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    fn immediate<T>(&self, f: impl FnOnce(&Connection) -> StrataResult<T>) -> StrataResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Copy the database to `destination` with the SQLite backup API.
    pub fn backup_to(&self, destination: &Path) -> StrataResult<()> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.conn.lock();
        let mut dst_conn = Connection::open(destination)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        info!(destination = %destination.display(), "state backup written");
        Ok(())
    }

    /// Number of raw interval records, before folding.
    pub fn interval_record_count(&self) -> StrataResult<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM _intervals;", [], |row| row.get(0))?)
    }
}

impl StateReader for SqliteStateStore {
    fn get_environment(&self, name: &str) -> StrataResult<Option<Environment>> {
        load_environment(&self.conn.lock(), name)
    }

    fn get_environments(&self) -> StrataResult<Vec<Environment>> {
        load_environments(&self.conn.lock())
    }

    fn get_snapshots(&self, ids: &[SnapshotId]) -> StrataResult<HashMap<SnapshotId, Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM _snapshots WHERE name = ?1 AND identifier = ?2;",
        )?;
        let mut result = HashMap::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = stmt
                .query_row(params![id.name, id.identifier], |row| row.get(0))
                .optional()?;
            let Some(raw) = payload else {
                continue;
            };
            let mut snapshot: Snapshot = serde_json::from_str(&raw)?;
            snapshot.intervals =
                representative_history(&conn, &snapshot.name, &snapshot.storage_revision())?;
            snapshot.dev_intervals = dev_history(&conn, id)?;
            result.insert(id.clone(), snapshot);
        }
        Ok(result)
    }

    fn get_representative_intervals(&self, name: &str, revision: &str) -> StrataResult<Intervals> {
        representative_history(&self.conn.lock(), name, revision)
    }
}

impl StateSync for SqliteStateStore {
    fn push_snapshots(&self, snapshots: &[Snapshot]) -> StrataResult<()> {
        self.immediate(|conn| {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO _snapshots (name, identifier, version, revision, created_ts, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(name, identifier) DO NOTHING;",
            )?;
            for snapshot in snapshots {
                stmt.execute(params![
                    snapshot.name,
                    snapshot.fingerprint.identifier(),
                    snapshot.version,
                    snapshot.storage_revision(),
                    snapshot.created_ts,
                    serde_json::to_string(&snapshot.without_intervals())?
                ])?;
            }
            Ok(())
        })?;
        debug!(count = snapshots.len(), "pushed snapshots");
        Ok(())
    }

    fn add_interval(
        &self,
        snapshot: &Snapshot,
        interval: Interval,
        is_dev: bool,
    ) -> StrataResult<()> {
        self.immediate(|conn| {
            let current = if is_dev {
                dev_history(conn, &snapshot.id())?
            } else {
                representative_history(conn, &snapshot.name, &snapshot.storage_revision())?
            };
            if !current.covers(interval) {
                insert_record(conn, snapshot, interval, is_dev, false)?;
            }
            Ok(())
        })
    }

    fn remove_interval(
        &self,
        snapshots: &[Snapshot],
        interval: Interval,
        is_dev: bool,
    ) -> StrataResult<()> {
        self.immediate(|conn| {
            for snapshot in snapshots {
                if !is_dev {
                    insert_record(conn, snapshot, interval, false, true)?;
                }
                insert_record(conn, snapshot, interval, true, true)?;
            }
            Ok(())
        })
    }

    fn promote(
        &self,
        environment: &Environment,
        expected_plan_id: Option<&str>,
    ) -> StrataResult<()> {
        self.immediate(|conn| {
            let existing = load_environment(conn, &environment.name)?;
            let found = live_plan_id(existing.as_ref(), environment.finalized_ts);
            if found.as_deref() != expected_plan_id {
                return Err(StrataError::StaleBase {
                    environment: environment.name.clone(),
                    expected: expected_plan_id.map(str::to_string),
                    found,
                });
            }
            save_environment(conn, environment)
        })?;
        debug!(environment = %environment.name, plan_id = %environment.plan_id, "promoted");
        Ok(())
    }

    fn invalidate_environment(&self, name: &str, now: Timestamp) -> StrataResult<()> {
        if name == self.prod_environment {
            return Err(StrataError::ProtectedEnvironment(name.to_string()));
        }
        self.immediate(|conn| {
            if let Some(mut environment) = load_environment(conn, name)? {
                environment.expiration_ts = Some(now);
                save_environment(conn, &environment)?;
            }
            Ok(())
        })
    }

    fn delete_expired_environments(&self, now: Timestamp) -> StrataResult<Vec<Environment>> {
        self.immediate(|conn| {
            let expired: Vec<Environment> = load_environments(conn)?
                .into_iter()
                .filter(|env| env.is_expired(now))
                .collect();
            for environment in &expired {
                conn.execute(
                    "DELETE FROM _environments WHERE name = ?1;",
                    params![environment.name],
                )?;
            }
            Ok(expired)
        })
    }

    fn expired_snapshots(&self, now: Timestamp, ttl: i64) -> StrataResult<Vec<SnapshotId>> {
        let conn = self.conn.lock();
        let referenced: HashSet<SnapshotId> = load_environments(&conn)?
            .into_iter()
            .filter(|env| !env.is_expired(now))
            .flat_map(|env| env.snapshots)
            .collect();
        let mut stmt = conn.prepare(
            "SELECT name, identifier FROM _snapshots WHERE created_ts <= ?1 \
             ORDER BY name, identifier;",
        )?;
        let rows = stmt.query_map(params![now.saturating_sub(ttl)], |row| {
            Ok(SnapshotId {
                name: row.get(0)?,
                identifier: row.get(1)?,
            })
        })?;
        let mut expired = Vec::new();
        for id in rows {
            let id = id?;
            if !referenced.contains(&id) {
                expired.push(id);
            }
        }
        Ok(expired)
    }

    fn delete_snapshots(&self, ids: &[SnapshotId]) -> StrataResult<()> {
        self.immediate(|conn| {
            for id in ids {
                conn.execute(
                    "DELETE FROM _snapshots WHERE name = ?1 AND identifier = ?2;",
                    params![id.name, id.identifier],
                )?;
                conn.execute(
                    "DELETE FROM _intervals WHERE name = ?1 AND identifier = ?2 AND is_dev = 1;",
                    params![id.name, id.identifier],
                )?;
            }
            conn.execute(
                "DELETE FROM _intervals WHERE is_dev = 0 AND NOT EXISTS ( \
                     SELECT 1 FROM _snapshots s \
                     WHERE s.name = _intervals.name AND s.revision = _intervals.revision);",
                [],
            )?;
            Ok(())
        })
    }

    fn compact_intervals(&self) -> StrataResult<()> {
        type Key = (bool, String, String);
        self.immediate(|conn| {
            let mut groups: BTreeMap<Key, (String, String, Vec<(Timestamp, Timestamp, bool)>)> =
                BTreeMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT name, identifier, revision, start_ts, end_ts, is_dev, is_removed \
                     FROM _intervals ORDER BY id;",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, bool>(6)?,
                    ))
                })?;
                for row in rows {
                    let (name, identifier, revision, start, end, is_dev, is_removed) = row?;
                    let owner = if is_dev { identifier.clone() } else { revision.clone() };
                    let entry = groups
                        .entry((is_dev, name, owner))
                        .or_insert_with(|| (identifier.clone(), revision.clone(), Vec::new()));
                    entry.0 = identifier;
                    entry.2.push((start, end, is_removed));
                }
            }

            conn.execute("DELETE FROM _intervals;", [])?;
            let written_at = now_ms();
            let mut insert = conn.prepare_cached(
                "INSERT INTO _intervals \
                 (name, identifier, revision, start_ts, end_ts, is_dev, is_removed, created_ts) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7);",
            )?;
            for ((is_dev, name, _), (identifier, revision, records)) in groups {
                for (start, end) in fold_records(records).into_vec() {
                    insert.execute(params![
                        name, identifier, revision, start, end, is_dev, written_at
                    ])?;
                }
            }
            Ok(())
        })?;
        debug!("compacted interval records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{environment, stored_snapshot};

    #[test]
    fn test_snapshot_round_trip_with_history() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let snapshot = stored_snapshot("db.a", &["id"]);
        store.push_snapshots(&[snapshot.clone()]).unwrap();
        store.push_snapshots(&[snapshot.clone()]).unwrap();
        store.add_interval(&snapshot, (0, 10), false).unwrap();
        store.add_interval(&snapshot, (10, 20), false).unwrap();
        store.add_interval(&snapshot, (5, 15), false).unwrap();
        store.add_interval(&snapshot, (100, 110), true).unwrap();

        let loaded = store.get_snapshots(&[snapshot.id()]).unwrap();
        let loaded = &loaded[&snapshot.id()];
        assert_eq!(loaded.intervals.as_slice(), &[(0, 20)]);
        assert_eq!(loaded.dev_intervals.as_slice(), &[(100, 110)]);
        assert_eq!(loaded.change_category, snapshot.change_category);
        // The covered re-add was not recorded.
        assert_eq!(store.interval_record_count().unwrap(), 3);
    }

    #[test]
    fn test_removal_records_fold_and_compact() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let snapshot = stored_snapshot("db.a", &["id"]);
        store.push_snapshots(&[snapshot.clone()]).unwrap();
        store.add_interval(&snapshot, (0, 100), false).unwrap();
        store.remove_interval(&[snapshot.clone()], (40, 60), false).unwrap();
        let loaded = store.get_snapshots(&[snapshot.id()]).unwrap();
        assert_eq!(
            loaded[&snapshot.id()].intervals.as_slice(),
            &[(0, 40), (60, 100)]
        );

        store.compact_intervals().unwrap();
        assert_eq!(store.interval_record_count().unwrap(), 2);
        let loaded = store.get_snapshots(&[snapshot.id()]).unwrap();
        assert_eq!(
            loaded[&snapshot.id()].intervals.as_slice(),
            &[(0, 40), (60, 100)]
        );
    }

    #[test]
    fn test_dev_removal_only_records_provisional() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let snapshot = stored_snapshot("db.a", &["id"]);
        store.push_snapshots(&[snapshot.clone()]).unwrap();
        store.add_interval(&snapshot, (0, 100), false).unwrap();
        store.remove_interval(&[snapshot.clone()], (40, 60), true).unwrap();

        let loaded = store.get_snapshots(&[snapshot.id()]).unwrap();
        assert_eq!(loaded[&snapshot.id()].intervals.as_slice(), &[(0, 100)]);
        assert!(loaded[&snapshot.id()].dev_intervals.is_empty());
    }

    #[test]
    fn test_promote_detects_stale_base() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.promote(&environment("dev", "one", &[]), None).unwrap();
        let err = store
            .promote(&environment("dev", "two", &[]), Some("zero"))
            .unwrap_err();
        assert!(err.is_retryable());
        store
            .promote(&environment("dev", "two", &[]), Some("one"))
            .unwrap();
        assert_eq!(store.get_environments().unwrap().len(), 1);
    }

    #[test]
    fn test_expiry_and_reclamation() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let live = stored_snapshot("db.live", &["id"]);
        let stale = stored_snapshot("db.stale", &["id"]);
        store.push_snapshots(&[live.clone(), stale.clone()]).unwrap();
        store.add_interval(&stale, (0, 10), false).unwrap();
        store
            .promote(&environment("prod", "p", &[live.id()]), None)
            .unwrap();
        store
            .promote(&environment("dev", "d", &[stale.id()]), None)
            .unwrap();

        assert!(matches!(
            store.invalidate_environment("prod", 10),
            Err(StrataError::ProtectedEnvironment(_))
        ));
        assert!(store.expired_snapshots(1_000, 10).unwrap().is_empty());
        store.invalidate_environment("dev", 10).unwrap();
        let removed = store.delete_expired_environments(10).unwrap();
        assert_eq!(removed[0].name, "dev");

        let expired = store.expired_snapshots(1_000, 10).unwrap();
        assert_eq!(expired, vec![stale.id()]);
        store.delete_snapshots(&expired).unwrap();
        assert!(store.get_snapshots(&[stale.id()]).unwrap().is_empty());
        assert_eq!(store.interval_record_count().unwrap(), 0);
    }

    #[test]
    fn test_file_database_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("strata.db");
        let snapshot = stored_snapshot("db.a", &["id"]);
        {
            let store = SqliteStateStore::open(&path).unwrap();
            assert_eq!(store.db_path(), Some(path.as_path()));
            store.push_snapshots(&[snapshot.clone()]).unwrap();
            store.add_interval(&snapshot, (0, 10), false).unwrap();
            store.backup_to(&dir.path().join("backup.db")).unwrap();
        }
        let reopened = SqliteStateStore::open(&dir.path().join("backup.db")).unwrap();
        let loaded = reopened.get_snapshots(&[snapshot.id()]).unwrap();
        assert_eq!(loaded[&snapshot.id()].intervals.as_slice(), &[(0, 10)]);
        let conn = Connection::open(&path).unwrap();
        assert_eq!(schema::get_schema_version(&conn), schema::SCHEMA_VERSION);
    }
}
