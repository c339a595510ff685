//! Composition root for the offline-first sync engine
//!
//! [`SyncEngine`] builds the network monitor, queue, resolver, manager and
//! status reporter from injected collaborators and exposes the local
//! mutation API: changes land in the replica immediately and are queued for
//! the backend.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::backend::StorageBackend;
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, RecordMerger};
use crate::db::{Database, SqliteReplica, SqliteSyncStore};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, Exercise, ExerciseId, FailedOperation, NewOperation, Operation,
    OperationId, OperationKind, Priority, Resolution, EXERCISES_TABLE,
};
use crate::mutation::LocalMutation;
use crate::network::NetworkMonitor;
use crate::notify::Subscription;
use crate::queue::OperationQueue;
use crate::replica::{LocalReplica, MemoryReplica};
use crate::store::{shared_store, MemoryStore, SharedStore};
use crate::sync::{
    RemoteChange, RemoteChangeOutcome, SyncDriver, SyncManager, SyncParts, SyncRunResult,
    SyncStatus, SyncStatusReporter,
};

pub struct SyncEngine {
    manager: Arc<SyncManager>,
    reporter: SyncStatusReporter,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Wire the engine from its collaborators
    pub fn new(
        config: SyncConfig,
        store: SharedStore,
        replica: Arc<dyn LocalReplica>,
        backend: Arc<dyn StorageBackend>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(OperationQueue::open(store.clone(), config.retry_policy())?);
        let resolver = Arc::new(ConflictResolver::open(store.clone(), &config)?);
        let manager = Arc::new(SyncManager::new(
            config,
            store,
            SyncParts {
                queue,
                resolver,
                network,
                backend,
                replica,
            },
        )?);
        let reporter = SyncStatusReporter::new(Arc::clone(&manager));
        Ok(Self { manager, reporter })
    }

    /// Everything in process memory
    pub fn in_memory(config: SyncConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        Self::new(
            config,
            shared_store(MemoryStore::new()),
            Arc::new(MemoryReplica::new()),
            backend,
            Arc::new(NetworkMonitor::new()),
        )
    }

    /// Queue, status, conflicts and replica persisted in one `SQLite` file
    pub fn open_sqlite(
        path: impl AsRef<Path>,
        config: SyncConfig,
        backend: Arc<dyn StorageBackend>,
        network: Arc<NetworkMonitor>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let store = shared_store(SqliteSyncStore::new(Database::open(path)?));
        let replica = Arc::new(SqliteReplica::new(Database::open(path)?));
        tracing::debug!(path = %path.display(), "Opened sync database");
        Self::new(config, store, replica, backend, network)
    }

    pub const fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        self.manager.network()
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        self.manager.queue()
    }

    pub fn replica(&self) -> &Arc<dyn LocalReplica> {
        self.manager.replica()
    }

    /// Record a new record locally and queue its creation
    pub fn create(
        &self,
        table: &str,
        record_id: &str,
        data: Value,
        priority: Priority,
    ) -> Result<Operation> {
        if self.replica().get(table, record_id)?.is_some() {
            return Err(Error::InvalidInput(format!(
                "{table}/{record_id} already exists"
            )));
        }
        self.mutate(NewOperation::create(table, record_id, data).with_priority(priority))
    }

    pub fn update(
        &self,
        table: &str,
        record_id: &str,
        data: Value,
        priority: Priority,
    ) -> Result<Operation> {
        self.mutate(NewOperation::update(table, record_id, data).with_priority(priority))
    }

    pub fn delete(&self, table: &str, record_id: &str, priority: Priority) -> Result<Operation> {
        if self.replica().get(table, record_id)?.is_none() {
            return Err(Error::NotFound(format!("{table}/{record_id}")));
        }
        self.mutate(NewOperation::delete(table, record_id).with_priority(priority))
    }

    /// Apply to the replica, then queue; the replica write is undone if queueing fails
    fn mutate(&self, new: NewOperation) -> Result<Operation> {
        if !matches!(new.kind, OperationKind::Delete) && !new.payload.is_object() {
            return Err(Error::InvalidInput(
                "record data must be a JSON object".to_string(),
            ));
        }

        let replica = self.replica();
        let prior_state = replica.get(&new.target_table, &new.record_id)?;
        let mutation = LocalMutation {
            table: new.target_table.clone(),
            record_id: new.record_id.clone(),
            before: prior_state.clone(),
            after: (new.kind != OperationKind::Delete).then(|| new.payload.clone()),
        };
        mutation.apply(replica.as_ref())?;

        match self.manager.enqueue(new.with_prior_state(prior_state)) {
            Ok(operation) => Ok(operation),
            Err(error) => {
                if let Err(undo) = mutation.inverse().apply(replica.as_ref()) {
                    tracing::error!(%undo, "Failed to undo local change after enqueue error");
                }
                Err(error)
            }
        }
    }

    pub fn add_exercise(&self, exercise: &Exercise, priority: Priority) -> Result<Operation> {
        exercise.validate()?;
        self.create(
            EXERCISES_TABLE,
            &exercise.id.as_str(),
            exercise.to_payload()?,
            priority,
        )
    }

    pub fn update_exercise(&self, exercise: &mut Exercise, priority: Priority) -> Result<Operation> {
        exercise.validate()?;
        exercise.touch();
        self.update(
            EXERCISES_TABLE,
            &exercise.id.as_str(),
            exercise.to_payload()?,
            priority,
        )
    }

    pub fn delete_exercise(&self, id: &ExerciseId, priority: Priority) -> Result<Operation> {
        self.delete(EXERCISES_TABLE, &id.as_str(), priority)
    }

    pub fn exercise(&self, id: &ExerciseId) -> Result<Option<Exercise>> {
        self.replica()
            .get(EXERCISES_TABLE, &id.as_str())?
            .map(|payload| Exercise::from_payload(&payload))
            .transpose()
    }

    /// Exercises in the local replica, newest first; unreadable rows are skipped
    pub fn exercises(&self) -> Result<Vec<Exercise>> {
        Ok(self
            .replica()
            .list(EXERCISES_TABLE)?
            .iter()
            .filter_map(|payload| match Exercise::from_payload(payload) {
                Ok(exercise) if !exercise.is_deleted => Some(exercise),
                Ok(_) => None,
                Err(error) => {
                    tracing::warn!(%error, "Skipping unreadable exercise record");
                    None
                }
            })
            .collect())
    }

    pub async fn process_now(&self) -> Result<SyncRunResult> {
        self.manager.process_now().await
    }

    /// Start automatic syncing; requires a Tokio runtime
    pub fn start(&self) -> SyncDriver {
        self.manager.start()
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.reporter.get_sync_status()
    }

    pub fn on_status_change<F>(&self, listener: F) -> Result<Subscription>
    where
        F: FnMut(SyncStatus) + Send + 'static,
    {
        self.reporter.on_sync_status_change(listener)
    }

    pub fn apply_remote_change(&self, change: RemoteChange) -> Result<RemoteChangeOutcome> {
        self.manager.apply_remote_change(change)
    }

    pub fn conflicts(&self) -> Result<Vec<Conflict>> {
        self.manager.resolver().unresolved()
    }

    pub fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged: Option<Value>,
    ) -> Result<Conflict> {
        self.manager.resolve_conflict(id, resolution, merged)
    }

    pub fn register_merger(&self, table: impl Into<String>, merger: Arc<dyn RecordMerger>) {
        self.manager.resolver().register_merger(table, merger);
    }

    pub fn failed(&self) -> Result<Vec<FailedOperation>> {
        self.queue().failed()
    }

    pub fn retry_failed(&self, id: &OperationId) -> Result<Operation> {
        self.manager.retry_failed(id)
    }

    /// Drop every pending operation; local changes not yet synced are not rolled back
    pub fn reset_queue(&self) -> Result<usize> {
        self.manager.reset_queue()
    }
}
