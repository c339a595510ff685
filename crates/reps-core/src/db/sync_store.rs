//! `SQLite` implementation of the sync persistence contract

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use std::str::FromStr;

use super::Database;
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, FailedOperation, FailureReason, Operation, OperationId, RecordKey,
    RecordSyncStatus,
};
use crate::store::SyncStore;

const OPERATION_COLUMNS: &str = "id, kind, target_table, record_id, payload, priority, created_at,
     attempts, last_attempt_at, next_attempt_at, batch_id, prior_state, overwrite, sequence";

/// Durable [`SyncStore`] backed by the local database
pub struct SqliteSyncStore {
    db: Database,
}

impl SqliteSyncStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    fn parse_operation(row: &Row<'_>) -> rusqlite::Result<Operation> {
        let sequence: i64 = row.get(13)?;
        Ok(Operation {
            id: OperationId::from(row.get::<_, String>(0)?),
            kind: parse_column(row, 1)?,
            target_table: row.get(2)?,
            record_id: row.get(3)?,
            payload: json_column(row, 4)?,
            priority: parse_column(row, 5)?,
            created_at: row.get(6)?,
            attempts: row.get(7)?,
            last_attempt_at: row.get(8)?,
            next_attempt_at: row.get(9)?,
            batch_id: row.get(10)?,
            prior_state: optional_json_column(row, 11)?,
            overwrite: row.get(12)?,
            sequence: u64::try_from(sequence).unwrap_or_default(),
        })
    }

    fn parse_status(row: &Row<'_>) -> rusqlite::Result<RecordSyncStatus> {
        Ok(RecordSyncStatus {
            key: RecordKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            status: parse_column(row, 2)?,
            last_sync_attempt: row.get(3)?,
            last_sync_success: row.get(4)?,
            retry_count: row.get(5)?,
            error_message: row.get(6)?,
            conflict_version: optional_json_column(row, 7)?,
        })
    }

    fn parse_conflict(row: &Row<'_>) -> rusqlite::Result<Conflict> {
        Ok(Conflict {
            id: ConflictId::from(row.get::<_, String>(0)?),
            table_name: row.get(1)?,
            record_id: row.get(2)?,
            local_version: json_column(row, 3)?,
            server_version: json_column(row, 4)?,
            conflict_type: parse_column(row, 5)?,
            detected_at: row.get(6)?,
            resolved_at: None,
            resolution: None,
            resolved_by: None,
            operation_id: OperationId::from(row.get::<_, String>(7)?),
            operation_kind: parse_column(row, 8)?,
            priority: parse_column(row, 9)?,
            merged_version: None,
        })
    }
}

/// Parse a text column through `FromStr`, surfacing failures as conversion errors
fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let raw: String = row.get(index)?;
    raw.parse()
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

/// JSON columns hold serialized text so `null` and numbers round-trip exactly
pub(super) fn json_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

fn optional_json_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))
        })
    })
    .transpose()
}

fn sequence_to_sql(sequence: u64) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

impl SyncStore for SqliteSyncStore {
    fn load_operations(&self) -> Result<Vec<Operation>> {
        let mut stmt = self.db.connection().prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM sync_operations ORDER BY sequence ASC"
        ))?;
        let operations = stmt
            .query_map([], Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn save_operation(&mut self, operation: &Operation) -> Result<()> {
        self.db.connection().execute(
            &format!(
                "INSERT OR REPLACE INTO sync_operations ({OPERATION_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                operation.id.as_str(),
                operation.kind.as_str(),
                operation.target_table,
                operation.record_id,
                operation.payload.to_string(),
                operation.priority.as_str(),
                operation.created_at,
                operation.attempts,
                operation.last_attempt_at,
                operation.next_attempt_at,
                operation.batch_id,
                operation.prior_state.as_ref().map(Value::to_string),
                operation.overwrite,
                sequence_to_sql(operation.sequence),
            ],
        )?;
        Ok(())
    }

    fn delete_operation(&mut self, id: &OperationId) -> Result<()> {
        self.db
            .connection()
            .execute("DELETE FROM sync_operations WHERE id = ?", params![id.as_str()])?;
        Ok(())
    }

    fn clear_operations(&mut self) -> Result<()> {
        self.db
            .connection()
            .execute("DELETE FROM sync_operations", [])?;
        Ok(())
    }

    fn load_failed(&self) -> Result<Vec<FailedOperation>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT operation, error, reason, failed_at FROM failed_operations
             ORDER BY failed_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    parse_column::<FailureReason>(row, 2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(operation, error, reason, failed_at)| -> Result<FailedOperation> {
                Ok(FailedOperation {
                    operation: serde_json::from_str(&operation)?,
                    error,
                    reason,
                    failed_at,
                })
            })
            .collect()
    }

    fn save_failed(&mut self, failed: &FailedOperation) -> Result<()> {
        let operation = serde_json::to_string(&failed.operation)?;
        self.db.connection().execute(
            "INSERT OR REPLACE INTO failed_operations (id, operation, error, reason, failed_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                failed.operation.id.as_str(),
                operation,
                failed.error,
                failed.reason.as_str(),
                failed.failed_at,
            ],
        )?;
        Ok(())
    }

    fn delete_failed(&mut self, id: &OperationId) -> Result<()> {
        self.db
            .connection()
            .execute("DELETE FROM failed_operations WHERE id = ?", params![id.as_str()])?;
        Ok(())
    }

    fn move_to_failed(&mut self, failed: &FailedOperation) -> Result<()> {
        let operation = serde_json::to_string(&failed.operation)?;
        let tx = self.db.connection_mut().transaction()?;
        tx.execute(
            "DELETE FROM sync_operations WHERE id = ?",
            params![failed.operation.id.as_str()],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO failed_operations (id, operation, error, reason, failed_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                failed.operation.id.as_str(),
                operation,
                failed.error,
                failed.reason.as_str(),
                failed.failed_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_statuses(&self) -> Result<Vec<RecordSyncStatus>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT table_name, record_id, status, last_sync_attempt, last_sync_success,
                    retry_count, error_message, conflict_version
             FROM sync_status",
        )?;
        let statuses = stmt
            .query_map([], Self::parse_status)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(statuses)
    }

    fn save_status(&mut self, status: &RecordSyncStatus) -> Result<()> {
        self.db.connection().execute(
            "INSERT OR REPLACE INTO sync_status (
                table_name, record_id, status, last_sync_attempt, last_sync_success,
                retry_count, error_message, conflict_version
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                status.key.table,
                status.key.record_id,
                status.status.as_str(),
                status.last_sync_attempt,
                status.last_sync_success,
                status.retry_count,
                status.error_message,
                status.conflict_version.as_ref().map(Value::to_string),
            ],
        )?;
        Ok(())
    }

    fn load_conflicts(&self) -> Result<Vec<Conflict>> {
        let mut stmt = self.db.connection().prepare(
            "SELECT id, table_name, record_id, local_version, server_version, conflict_type,
                    detected_at, operation_id, operation_kind, priority
             FROM sync_conflicts
             ORDER BY detected_at ASC",
        )?;
        let conflicts = stmt
            .query_map([], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    fn save_conflict(&mut self, conflict: &Conflict) -> Result<()> {
        let tx = self.db.connection_mut().transaction()?;
        // The unique (table_name, record_id) index keeps one unresolved conflict per record
        tx.execute(
            "DELETE FROM sync_conflicts WHERE table_name = ? AND record_id = ?",
            params![conflict.table_name, conflict.record_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO sync_conflicts (
                id, table_name, record_id, local_version, server_version, conflict_type,
                detected_at, operation_id, operation_kind, priority
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                conflict.id.as_str(),
                conflict.table_name,
                conflict.record_id,
                conflict.local_version.to_string(),
                conflict.server_version.to_string(),
                conflict.conflict_type.as_str(),
                conflict.detected_at,
                conflict.operation_id.as_str(),
                conflict.operation_kind.as_str(),
                conflict.priority.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn delete_conflict(&mut self, id: &ConflictId) -> Result<()> {
        self.db
            .connection()
            .execute("DELETE FROM sync_conflicts WHERE id = ?", params![id.as_str()])?;
        Ok(())
    }
}

impl SqliteSyncStore {
    /// Look up one status row without loading the whole table
    pub fn status(&self, key: &RecordKey) -> Result<Option<RecordSyncStatus>> {
        let status = self
            .db
            .connection()
            .query_row(
                "SELECT table_name, record_id, status, last_sync_attempt, last_sync_success,
                        retry_count, error_message, conflict_version
                 FROM sync_status WHERE table_name = ? AND record_id = ?",
                params![key.table, key.record_id],
                Self::parse_status,
            )
            .optional()?;
        Ok(status)
    }
}
