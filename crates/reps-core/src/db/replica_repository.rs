//! `SQLite` implementation of the local replica

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::sync_store::json_column;
use super::Database;
use crate::error::{Error, Result};
use crate::replica::{record_timestamp, LocalReplica};
use crate::util::now_ms;

/// Replica rows live in `local_records`, one JSON document per record
pub struct SqliteReplica {
    db: Mutex<Database>,
}

impl SqliteReplica {
    pub const fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| Error::Database("replica connection lock poisoned".to_string()))
    }
}

impl LocalReplica for SqliteReplica {
    fn get(&self, table: &str, record_id: &str) -> Result<Option<Value>> {
        let db = self.db()?;
        let data = db
            .connection()
            .query_row(
                "SELECT data FROM local_records WHERE table_name = ? AND record_id = ?",
                params![table, record_id],
                |row| json_column(row, 0),
            )
            .optional()?;
        Ok(data)
    }

    fn put(&self, table: &str, record_id: &str, data: &Value) -> Result<()> {
        let updated_at = record_timestamp(data, "updated_at").unwrap_or_else(now_ms);
        self.db()?.connection().execute(
            "INSERT INTO local_records (table_name, record_id, data, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(table_name, record_id)
             DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![table, record_id, data.to_string(), updated_at],
        )?;
        Ok(())
    }

    fn remove(&self, table: &str, record_id: &str) -> Result<()> {
        self.db()?.connection().execute(
            "DELETE FROM local_records WHERE table_name = ? AND record_id = ?",
            params![table, record_id],
        )?;
        Ok(())
    }

    fn list(&self, table: &str) -> Result<Vec<Value>> {
        let db = self.db()?;
        let mut stmt = db.connection().prepare(
            "SELECT data FROM local_records WHERE table_name = ?
             ORDER BY updated_at DESC, record_id ASC",
        )?;
        let rows = stmt
            .query_map(params![table], |row| json_column(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn setup() -> SqliteReplica {
        SqliteReplica::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_put_replaces_existing_record() {
        let replica = setup();
        replica
            .put("exercises", "ex-1", &json!({"name": "Squat", "updated_at": 1}))
            .unwrap();
        replica
            .put("exercises", "ex-1", &json!({"name": "Front squat", "updated_at": 2}))
            .unwrap();

        assert_eq!(
            replica.get("exercises", "ex-1").unwrap(),
            Some(json!({"name": "Front squat", "updated_at": 2}))
        );
        assert_eq!(replica.list("exercises").unwrap().len(), 1);
    }

    #[test]
    fn test_list_orders_newest_first() {
        let replica = setup();
        replica
            .put("exercises", "old", &json!({"updated_at": 10}))
            .unwrap();
        replica
            .put("exercises", "new", &json!({"updated_at": 20}))
            .unwrap();
        replica.put("workouts", "other", &json!({})).unwrap();

        assert_eq!(
            replica.list("exercises").unwrap(),
            vec![json!({"updated_at": 20}), json!({"updated_at": 10})]
        );
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let replica = setup();
        replica.remove("exercises", "missing").unwrap();
        assert!(replica.get("exercises", "missing").unwrap().is_none());
    }

    #[test]
    fn test_records_survive_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("reps.db");
        {
            let replica = SqliteReplica::new(Database::open(&path).unwrap());
            replica
                .put("exercises", "ex-1", &json!({"name": "Deadlift"}))
                .unwrap();
        }

        let replica = SqliteReplica::new(Database::open(&path).unwrap());
        assert_eq!(
            replica.get("exercises", "ex-1").unwrap(),
            Some(json!({"name": "Deadlift"}))
        );
    }
}
