//! In-process backend for tests and offline simulation

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ApplyOutcome, BackendError, ServerVersion, StorageBackend};
use crate::models::{ConflictType, Operation, OperationId, OperationKind, RecordKey};
use crate::replica::record_timestamp;

#[derive(Debug, Clone)]
enum Scripted {
    Fail(BackendError),
    Conflict(ConflictType),
}

#[derive(Debug)]
struct BackendState {
    records: BTreeMap<RecordKey, Value>,
    online: bool,
    latency: Duration,
    scripted: HashMap<String, VecDeque<Scripted>>,
    applied: Vec<OperationId>,
    apply_calls: usize,
}

/// Remote store simulated in memory
///
/// Conflicts are detected from the configured timestamp field: an update or
/// delete whose pre-image is older than the server copy conflicts, as does a
/// create of a record that already exists with different contents.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    timestamp_field: String,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_timestamp_field("updated_at")
    }

    pub fn with_timestamp_field(field: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(BackendState {
                records: BTreeMap::new(),
                online: true,
                latency: Duration::ZERO,
                scripted: HashMap::new(),
                applied: Vec::new(),
                apply_calls: 0,
            }),
            timestamp_field: field.into(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        // Test double: a poisoned lock still holds consistent data
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Simulate losing or regaining the network
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Delay every apply call
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Fail the next `times` applies for `record_id` with `error`
    pub fn fail_next(&self, record_id: &str, error: BackendError, times: usize) {
        let mut state = self.state();
        let script = state.scripted.entry(record_id.to_string()).or_default();
        script.extend(std::iter::repeat(Scripted::Fail(error)).take(times));
    }

    /// Report a conflict of `conflict_type` on the next apply for `record_id`
    pub fn conflict_next(&self, record_id: &str, conflict_type: ConflictType) {
        self.state()
            .scripted
            .entry(record_id.to_string())
            .or_default()
            .push_back(Scripted::Conflict(conflict_type));
    }

    /// Write a record directly, as another device would
    pub fn seed(&self, table: &str, record_id: &str, data: Value) {
        self.state()
            .records
            .insert(RecordKey::new(table, record_id), data);
    }

    pub fn record(&self, table: &str, record_id: &str) -> Option<Value> {
        self.state()
            .records
            .get(&RecordKey::new(table, record_id))
            .cloned()
    }

    pub fn records(&self, table: &str) -> Vec<Value> {
        self.state()
            .records
            .iter()
            .filter(|(key, _)| key.table == table)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Number of apply calls received, including failed ones
    pub fn apply_count(&self) -> usize {
        self.state().apply_calls
    }

    /// Operations applied successfully, in order
    pub fn applied(&self) -> Vec<OperationId> {
        self.state().applied.clone()
    }

    fn stamp(&self, value: &Value) -> Option<i64> {
        record_timestamp(value, &self.timestamp_field)
    }

    /// Server copy is strictly newer than the version the operation was based on
    fn server_is_newer(&self, server: &Value, base: Option<&Value>) -> bool {
        match (self.stamp(server), base.and_then(|base| self.stamp(base))) {
            (Some(server), Some(base)) => server > base,
            _ => false,
        }
    }

    fn apply_locked(&self, state: &mut BackendState, operation: &Operation) -> ApplyOutcome {
        let key = operation.record_key();
        let existing = state.records.get(&key).cloned();

        match operation.kind {
            OperationKind::Create => {
                if !operation.payload.is_object() {
                    return ApplyOutcome::Failed(BackendError::Malformed(
                        "create payload must be a JSON object".to_string(),
                    ));
                }
                if let Some(server) = existing {
                    if server != operation.payload && !operation.overwrite {
                        return ApplyOutcome::Conflict(ServerVersion {
                            data: server,
                            conflict_type: ConflictType::ConcurrentUpdate,
                        });
                    }
                }
                state.records.insert(key, operation.payload.clone());
            }
            OperationKind::Update => {
                if !operation.payload.is_object() {
                    return ApplyOutcome::Failed(BackendError::Malformed(
                        "update payload must be a JSON object".to_string(),
                    ));
                }
                match existing {
                    None if !operation.overwrite => {
                        return ApplyOutcome::Conflict(ServerVersion {
                            data: Value::Null,
                            conflict_type: ConflictType::DeleteConflict,
                        });
                    }
                    Some(server)
                        if !operation.overwrite
                            && server != operation.payload
                            && self.server_is_newer(&server, operation.prior_state.as_ref()) =>
                    {
                        return ApplyOutcome::Conflict(ServerVersion {
                            data: server,
                            conflict_type: ConflictType::ConcurrentUpdate,
                        });
                    }
                    _ => {
                        state.records.insert(key, operation.payload.clone());
                    }
                }
            }
            OperationKind::Delete => {
                if let Some(server) = existing {
                    if !operation.overwrite
                        && self.server_is_newer(&server, operation.prior_state.as_ref())
                    {
                        return ApplyOutcome::Conflict(ServerVersion {
                            data: server,
                            conflict_type: ConflictType::DeleteConflict,
                        });
                    }
                    state.records.remove(&key);
                }
            }
        }

        state.applied.push(operation.id.clone());
        ApplyOutcome::Applied
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn apply(&self, operation: &Operation) -> ApplyOutcome {
        let latency = {
            let mut state = self.state();
            state.apply_calls += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if !state.online {
            return ApplyOutcome::Failed(BackendError::Network("backend unreachable".to_string()));
        }

        let scripted = state
            .scripted
            .get_mut(&operation.record_id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(Scripted::Fail(error)) => ApplyOutcome::Failed(error),
            Some(Scripted::Conflict(conflict_type)) => {
                let data = state
                    .records
                    .get(&operation.record_key())
                    .cloned()
                    .unwrap_or(Value::Null);
                ApplyOutcome::Conflict(ServerVersion {
                    data,
                    conflict_type,
                })
            }
            None => self.apply_locked(&mut state, operation),
        }
    }
}
