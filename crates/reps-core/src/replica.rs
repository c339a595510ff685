//! Local read model that optimistic writes land in before they sync

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::RecordKey;

/// Device-local copy of synced records, keyed by table and record id
pub trait LocalReplica: Send + Sync {
    fn get(&self, table: &str, record_id: &str) -> Result<Option<Value>>;

    /// Insert or replace a record
    fn put(&self, table: &str, record_id: &str, data: &Value) -> Result<()>;

    /// Remove a record; absent records are a no-op
    fn remove(&self, table: &str, record_id: &str) -> Result<()>;

    /// All records of a table, most recently updated first
    fn list(&self, table: &str) -> Result<Vec<Value>>;
}

/// Replica held in process memory
#[derive(Debug, Default)]
pub struct MemoryReplica {
    records: Mutex<BTreeMap<RecordKey, Value>>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<RecordKey, Value>>> {
        self.records
            .lock()
            .map_err(|_| Error::StoreUnavailable("replica lock poisoned".to_string()))
    }
}

impl LocalReplica for MemoryReplica {
    fn get(&self, table: &str, record_id: &str) -> Result<Option<Value>> {
        Ok(self.records()?.get(&RecordKey::new(table, record_id)).cloned())
    }

    fn put(&self, table: &str, record_id: &str, data: &Value) -> Result<()> {
        self.records()?
            .insert(RecordKey::new(table, record_id), data.clone());
        Ok(())
    }

    fn remove(&self, table: &str, record_id: &str) -> Result<()> {
        self.records()?.remove(&RecordKey::new(table, record_id));
        Ok(())
    }

    fn list(&self, table: &str) -> Result<Vec<Value>> {
        let mut values = self
            .records()?
            .iter()
            .filter(|(key, _)| key.table == table)
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>();
        values.sort_by_key(|value| std::cmp::Reverse(record_timestamp(value, "updated_at")));
        Ok(values)
    }
}

/// Read a modification timestamp (Unix ms) from a record field
///
/// Accepts integer milliseconds or an RFC 3339 string.
pub fn record_timestamp(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => chrono::DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|timestamp| timestamp.timestamp_millis()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_remove() {
        let replica = MemoryReplica::new();
        replica.put("exercises", "a", &json!({"name": "Squat"})).unwrap();
        assert_eq!(
            replica.get("exercises", "a").unwrap(),
            Some(json!({"name": "Squat"}))
        );

        replica.remove("exercises", "a").unwrap();
        replica.remove("exercises", "a").unwrap();
        assert!(replica.get("exercises", "a").unwrap().is_none());
    }

    #[test]
    fn list_filters_by_table_newest_first() {
        let replica = MemoryReplica::new();
        replica
            .put("exercises", "a", &json!({"updated_at": 1}))
            .unwrap();
        replica
            .put("exercises", "b", &json!({"updated_at": 2}))
            .unwrap();
        replica.put("workouts", "c", &json!({"updated_at": 3})).unwrap();

        let listed = replica.list("exercises").unwrap();
        assert_eq!(listed, vec![json!({"updated_at": 2}), json!({"updated_at": 1})]);
    }

    #[test]
    fn record_timestamp_accepts_numbers_and_rfc3339() {
        assert_eq!(record_timestamp(&json!({"updated_at": 42}), "updated_at"), Some(42));
        assert_eq!(
            record_timestamp(
                &json!({"updated_at": "1970-01-01T00:00:01Z"}),
                "updated_at"
            ),
            Some(1_000)
        );
        assert_eq!(record_timestamp(&json!({"updated_at": true}), "updated_at"), None);
        assert_eq!(record_timestamp(&json!({}), "updated_at"), None);
    }
}
