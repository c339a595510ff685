//! Database migrations

use crate::error::Result;
use rusqlite::{params, Connection};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, V1_OPERATION_QUEUE)?;
    }
    if version < 2 {
        apply(conn, 2, V2_CONFLICTS)?;
    }
    if version < 3 {
        apply(conn, 3, V3_LOCAL_RECORDS)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Apply one migration atomically; the transaction rolls back on drop if any statement fails
fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for statement in statements {
        tx.execute_batch(statement)?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        params![version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: pending queue, terminal failures, per-record status
const V1_OPERATION_QUEUE: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_operations (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        target_table TEXT NOT NULL,
        record_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts BETWEEN 0 AND 5),
        last_attempt_at INTEGER,
        next_attempt_at INTEGER,
        batch_id TEXT,
        prior_state TEXT,
        overwrite INTEGER NOT NULL DEFAULT 0,
        sequence INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_operations_record
        ON sync_operations(target_table, record_id, sequence)",
    "CREATE TABLE IF NOT EXISTS failed_operations (
        id TEXT PRIMARY KEY,
        operation TEXT NOT NULL,
        error TEXT NOT NULL,
        reason TEXT NOT NULL,
        failed_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_failed_operations_failed_at
        ON failed_operations(failed_at DESC)",
    "CREATE TABLE IF NOT EXISTS sync_status (
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        status TEXT NOT NULL,
        last_sync_attempt INTEGER,
        last_sync_success INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count BETWEEN 0 AND 5),
        error_message TEXT,
        conflict_version TEXT,
        PRIMARY KEY (table_name, record_id)
    )",
];

/// Version 2: unresolved conflicts, at most one per record
const V2_CONFLICTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_conflicts (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        local_version TEXT NOT NULL,
        server_version TEXT NOT NULL,
        conflict_type TEXT NOT NULL,
        detected_at INTEGER NOT NULL,
        operation_id TEXT NOT NULL,
        operation_kind TEXT NOT NULL,
        priority TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_conflicts_record
        ON sync_conflicts(table_name, record_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at
        ON sync_conflicts(detected_at DESC)",
];

/// Version 3: local read model
const V3_LOCAL_RECORDS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS local_records (
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (table_name, record_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_local_records_updated
        ON local_records(table_name, updated_at DESC)",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            params![name],
            |row| row.get::<_, i32>(0),
        )
        .unwrap()
            != 0
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_sync_tables() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in [
            "sync_operations",
            "failed_operations",
            "sync_status",
            "sync_conflicts",
            "local_records",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_attempts_check_constraint() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let result = conn.execute(
            "INSERT INTO sync_operations
                (id, kind, target_table, record_id, payload, priority, created_at, attempts, sequence)
             VALUES ('op', 'create', 'exercises', 'ex', '{}', 'low', 0, 6, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
