//! Conflict detection and resolution
//!
//! The resolver owns [`Conflict`] records from detection until they are
//! settled. At most one unresolved conflict exists per record: a new
//! detection for the same record supersedes the old one. Unresolved conflicts
//! are persisted through the [`SharedStore`]; settled ones are kept in a
//! bounded in-memory history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::Value;

use crate::backend::ServerVersion;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, ConflictType, Operation, RecordKey, Resolution, ResolvedBy,
};
use crate::replica::record_timestamp;
use crate::store::{lock_store, SharedStore};
use crate::util::now_ms;

/// Settled conflicts kept for listing
pub const HISTORY_LIMIT: usize = 100;

/// Field-level merge for one record type
pub trait RecordMerger: Send + Sync {
    /// Combine both sides, or `None` to fall back to last-write-wins
    fn merge(&self, local: &Value, server: &Value) -> Option<Value>;
}

#[derive(Debug, Default)]
struct ResolverState {
    unresolved: Vec<Conflict>,
    history: VecDeque<Conflict>,
}

pub struct ConflictResolver {
    store: SharedStore,
    state: Mutex<ResolverState>,
    mergers: RwLock<HashMap<String, Arc<dyn RecordMerger>>>,
    timestamp_field: String,
    auto_resolve_enabled: bool,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("timestamp_field", &self.timestamp_field)
            .field("auto_resolve_enabled", &self.auto_resolve_enabled)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Load unresolved conflicts from `store`
    pub fn open(store: SharedStore, config: &SyncConfig) -> Result<Self> {
        let mut unresolved = lock_store(&store)?.load_conflicts()?;
        unresolved.sort_by_key(|conflict| conflict.detected_at);
        Ok(Self {
            store,
            state: Mutex::new(ResolverState {
                unresolved,
                history: VecDeque::new(),
            }),
            mergers: RwLock::new(HashMap::new()),
            timestamp_field: config.conflict_timestamp_field.clone(),
            auto_resolve_enabled: config.auto_resolve_conflicts,
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, ResolverState>> {
        self.state
            .lock()
            .map_err(|_| Error::StoreUnavailable("conflict resolver lock poisoned".to_string()))
    }

    pub const fn auto_resolve_enabled(&self) -> bool {
        self.auto_resolve_enabled
    }

    /// Use `merger` for conflicts on `table`
    pub fn register_merger(&self, table: impl Into<String>, merger: Arc<dyn RecordMerger>) {
        if let Ok(mut mergers) = self.mergers.write() {
            mergers.insert(table.into(), merger);
        }
    }

    fn merger(&self, table: &str) -> Option<Arc<dyn RecordMerger>> {
        self.mergers.read().ok()?.get(table).cloned()
    }

    /// Record a conflict for `operation`, replacing any unresolved one for the same record
    pub fn detect(&self, operation: &Operation, server: &ServerVersion) -> Result<Conflict> {
        let conflict = Conflict {
            id: ConflictId::new(),
            table_name: operation.target_table.clone(),
            record_id: operation.record_id.clone(),
            local_version: operation.payload.clone(),
            server_version: server.data.clone(),
            conflict_type: server.conflict_type,
            detected_at: now_ms(),
            resolved_at: None,
            resolution: None,
            resolved_by: None,
            operation_id: operation.id.clone(),
            operation_kind: operation.kind,
            priority: operation.priority,
            merged_version: None,
        };

        let mut state = self.state()?;
        lock_store(&self.store)?.save_conflict(&conflict)?;
        let key = conflict.record_key();
        let before = state.unresolved.len();
        state.unresolved.retain(|existing| existing.record_key() != key);
        if state.unresolved.len() != before {
            tracing::warn!(record = %key, "Superseding unresolved conflict");
        }
        state.unresolved.push(conflict.clone());

        tracing::info!(
            conflict_id = %conflict.id,
            record = %key,
            conflict_type = conflict.conflict_type.as_str(),
            "Conflict detected"
        );
        Ok(conflict)
    }

    /// Detect, then auto-resolve when enabled or leave for the user
    pub fn handle(&self, operation: &Operation, server: &ServerVersion) -> Result<Conflict> {
        let conflict = self.detect(operation, server)?;
        if self.auto_resolve_enabled {
            if let Some(resolved) = self.auto_resolve(&conflict.id)? {
                return Ok(resolved);
            }
        }
        self.queue_manual_resolution(&conflict.id)?;
        Ok(conflict)
    }

    /// Settle a conflict without user input
    ///
    /// Schema mismatches are never auto-resolved. A registered merger wins
    /// first; otherwise the later timestamp wins and the server wins ties.
    /// Returns `None` when no decision can be made (e.g. a side has no
    /// timestamp).
    pub fn auto_resolve(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let conflict = self.unresolved_by_id(id)?;
        if conflict.conflict_type == ConflictType::SchemaMismatch {
            return Ok(None);
        }

        if let Some(merged) = self.merge_with_registered(
            &conflict.table_name,
            &conflict.local_version,
            &conflict.server_version,
        ) {
            return self
                .settle(id, Resolution::Merged, ResolvedBy::System, Some(merged))
                .map(Some);
        }

        match self.last_write_wins(&conflict.local_version, &conflict.server_version) {
            Some(resolution) => self
                .settle(id, resolution, ResolvedBy::System, None)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Domain merge for `table`, falling back to the last-write-wins winner
    pub fn resolve_domain(&self, table: &str, local: &Value, server: &Value) -> Option<Value> {
        if let Some(merged) = self.merge_with_registered(table, local, server) {
            return Some(merged);
        }
        match self.last_write_wins(local, server)? {
            Resolution::LocalWins => Some(local.clone()),
            _ => Some(server.clone()),
        }
    }

    /// Leave a conflict unresolved for an external decision
    pub fn queue_manual_resolution(&self, id: &ConflictId) -> Result<()> {
        let conflict = self.unresolved_by_id(id)?;
        tracing::info!(
            conflict_id = %id,
            record = %conflict.record_key(),
            "Conflict awaiting manual resolution"
        );
        Ok(())
    }

    /// Apply a user decision
    pub fn resolve_manually(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged: Option<Value>,
    ) -> Result<Conflict> {
        self.settle(id, resolution, ResolvedBy::User, merged)
    }

    pub fn unresolved(&self) -> Result<Vec<Conflict>> {
        Ok(self.state()?.unresolved.clone())
    }

    pub fn unresolved_for(&self, key: &RecordKey) -> Result<Option<Conflict>> {
        Ok(self
            .state()?
            .unresolved
            .iter()
            .find(|conflict| &conflict.record_key() == key)
            .cloned())
    }

    /// Settled conflicts, most recent last
    pub fn history(&self) -> Result<Vec<Conflict>> {
        Ok(self.state()?.history.iter().cloned().collect())
    }

    fn unresolved_by_id(&self, id: &ConflictId) -> Result<Conflict> {
        self.state()?
            .unresolved
            .iter()
            .find(|conflict| &conflict.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unresolved conflict {id}")))
    }

    fn merge_with_registered(&self, table: &str, local: &Value, server: &Value) -> Option<Value> {
        self.merger(table)?.merge(local, server)
    }

    fn last_write_wins(&self, local: &Value, server: &Value) -> Option<Resolution> {
        let local = record_timestamp(local, &self.timestamp_field)?;
        let server = record_timestamp(server, &self.timestamp_field)?;
        Some(if local > server {
            Resolution::LocalWins
        } else {
            Resolution::ServerWins
        })
    }

    fn settle(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        resolved_by: ResolvedBy,
        merged: Option<Value>,
    ) -> Result<Conflict> {
        let mut state = self.state()?;
        let index = state
            .unresolved
            .iter()
            .position(|conflict| &conflict.id == id)
            .ok_or_else(|| Error::NotFound(format!("unresolved conflict {id}")))?;

        let mut conflict = state.unresolved[index].clone();
        conflict.resolve(resolution, resolved_by, merged, now_ms())?;
        lock_store(&self.store)?.delete_conflict(id)?;

        state.unresolved.remove(index);
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(conflict.clone());

        tracing::info!(
            conflict_id = %id,
            resolution = resolution.as_str(),
            resolved_by = resolved_by.as_str(),
            "Conflict resolved"
        );
        Ok(conflict)
    }
}
