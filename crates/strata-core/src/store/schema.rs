//! SQLite schema DDL and migration framework for the state store.

use rusqlite::Connection;

use crate::errors::StrataResult;

/// Current schema version. Migrations run from whatever the database
/// currently reports up to this value.
pub const SCHEMA_VERSION: i32 = 3;

/// Core DDL, safe to replay on an initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS _strata_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS _snapshots (
        name TEXT NOT NULL,
        identifier TEXT NOT NULL,
        version TEXT,
        revision TEXT,
        created_ts INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY(name, identifier)
    );",
    "CREATE TABLE IF NOT EXISTS _environments (
        name TEXT PRIMARY KEY,
        plan_id TEXT NOT NULL,
        expiration_ts INTEGER,
        payload TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS _intervals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        identifier TEXT NOT NULL,
        revision TEXT NOT NULL,
        start_ts INTEGER NOT NULL,
        end_ts INTEGER NOT NULL,
        is_dev INTEGER NOT NULL DEFAULT 0,
        is_removed INTEGER NOT NULL DEFAULT 0
    );",
    "CREATE TABLE IF NOT EXISTS _migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_intervals_revision ON _intervals(name, revision, is_dev);",
    "CREATE INDEX IF NOT EXISTS idx_intervals_identifier ON _intervals(name, identifier, is_dev);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations up to [`SCHEMA_VERSION`]. Each step runs in a
/// SAVEPOINT so a failure rolls back only that step.
pub fn migrate_schema(conn: &Connection) -> StrataResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT strata_migrate_step;")?;

        let step_result = (|| -> StrataResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                3 => migrate_to_v3(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT strata_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT strata_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT strata_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Stored schema version, 0 when absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM _strata_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> StrataResult<()> {
    conn.execute(
        "INSERT INTO _strata_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> StrataResult<()> {
    conn.execute(
        "INSERT INTO _migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> StrataResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline.
fn migrate_to_v1(_conn: &Connection) -> StrataResult<()> {
    Ok(())
}

/// v1 -> v2: index snapshots by creation time for reclamation sweeps.
fn migrate_to_v2(conn: &Connection) -> StrataResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_created ON _snapshots(created_ts);",
    )?;
    Ok(())
}

/// v2 -> v3: stamp interval records with their write time.
fn migrate_to_v3(conn: &Connection) -> StrataResult<()> {
    if !column_exists(conn, "_intervals", "created_ts")? {
        conn.execute_batch(
            "ALTER TABLE _intervals ADD COLUMN created_ts INTEGER NOT NULL DEFAULT 0;",
        )?;
    }
    Ok(())
}
