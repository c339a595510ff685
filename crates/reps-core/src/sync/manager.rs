//! Queue drain orchestration
//!
//! A processing pass dequeues a batch sized for the current link, applies each
//! operation through the [`StorageBackend`] and records the outcome:
//!
//! - applied: the operation leaves the queue and the record is `synced`
//! - conflict: the operation leaves the queue and the [`ConflictResolver`]
//!   takes over; resolved conflicts are followed up immediately
//! - retryable failure: the operation stays queued behind a backoff deadline
//! - terminal failure: the operation moves to the failed records and its
//!   optimistic local change is rolled back
//!
//! Only one pass runs at a time. Per-operation failures are reported in
//! [`SyncRunResult::errors`]; only local storage failures return `Err`.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::backend::{ApplyOutcome, BackendError, ServerVersion, StorageBackend};
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, FailedOperation, NewOperation, Operation, OperationId, RecordKey,
    RecordSyncStatus, Resolution, SyncState,
};
use crate::mutation::LocalMutation;
use crate::network::NetworkMonitor;
use crate::queue::{AttemptDisposition, AttemptOutcome, OperationQueue};
use crate::replica::LocalReplica;
use crate::store::{lock_store, SharedStore};
use crate::util::now_ms;

use super::driver::SyncDriver;

/// Collaborators a [`SyncManager`] drives
#[derive(Clone)]
pub struct SyncParts {
    pub queue: Arc<OperationQueue>,
    pub resolver: Arc<ConflictResolver>,
    pub network: Arc<NetworkMonitor>,
    pub backend: Arc<dyn StorageBackend>,
    pub replica: Arc<dyn LocalReplica>,
}

/// Per-operation failure captured during a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEntry {
    /// Operation that failed
    pub id: OperationId,
    pub operation: Operation,
    pub error: String,
    pub timestamp: i64,
    pub retryable: bool,
}

/// How a `process_now` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDisposition {
    Completed,
    /// Another pass held the processing slot; nothing was attempted
    AlreadyProcessing,
    /// Known offline; nothing was attempted
    Offline,
}

/// Outcome of one processing pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRunResult {
    /// `processed > 0`
    pub success: bool,
    pub processed: usize,
    pub remaining: usize,
    pub conflicts: usize,
    pub errors: Vec<SyncErrorEntry>,
    pub disposition: RunDisposition,
    pub finished_at: i64,
}

impl SyncRunResult {
    fn empty(disposition: RunDisposition, remaining: usize) -> Self {
        Self {
            success: false,
            processed: 0,
            remaining,
            conflicts: 0,
            errors: Vec::new(),
            disposition,
            finished_at: now_ms(),
        }
    }

    pub fn already_processing(&self) -> bool {
        self.disposition == RunDisposition::AlreadyProcessing
    }
}

/// Where the manager's state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Processing,
    /// Nothing to do until the earliest backoff deadline (Unix ms)
    BackoffWait { until: i64 },
}

/// A change that originated on the server (e.g. a realtime subscription)
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub table: String,
    pub record_id: String,
    /// `None` when the record was deleted remotely
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChangeOutcome {
    /// Written to the replica; the record is `synced`
    Applied,
    /// A local change for the record is still in flight; left to conflict detection
    Deferred,
}

#[derive(Debug, Default)]
struct ManagerState {
    statuses: BTreeMap<RecordKey, RecordSyncStatus>,
    last_run: Option<SyncRunResult>,
    last_sync_at: Option<i64>,
}

pub struct SyncManager {
    config: SyncConfig,
    store: SharedStore,
    parts: SyncParts,
    state: Mutex<ManagerState>,
    revision: watch::Sender<u64>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Load per-record status from `store`
    ///
    /// Records left `syncing` by an interrupted pass are put back to `pending`.
    pub fn new(config: SyncConfig, store: SharedStore, parts: SyncParts) -> Result<Self> {
        config.validate()?;

        let mut statuses = BTreeMap::new();
        {
            let mut store = lock_store(&store)?;
            for mut status in store.load_statuses()? {
                if status.status == SyncState::Syncing {
                    tracing::warn!(record = %status.key, "Recovering record left mid-sync");
                    status.status = SyncState::Pending;
                    store.save_status(&status)?;
                }
                statuses.insert(status.key.clone(), status);
            }
        }

        let (revision, _) = watch::channel(0);
        Ok(Self {
            config,
            store,
            parts,
            state: Mutex::new(ManagerState {
                statuses,
                ..ManagerState::default()
            }),
            revision,
        })
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.parts.queue
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.parts.resolver
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.parts.network
    }

    pub fn replica(&self) -> &Arc<dyn LocalReplica> {
        &self.parts.replica
    }

    fn state(&self) -> Result<MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|_| Error::StoreUnavailable("sync manager lock poisoned".to_string()))
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    /// Receiver bumped whenever record status or the last run changes
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Queue a local change and mark its record `pending`
    pub fn enqueue(&self, new: NewOperation) -> Result<Operation> {
        let operation = self.parts.queue.enqueue(new)?;
        self.update_status(&operation.record_key(), note_local_change)?;
        Ok(operation)
    }

    /// Run one processing pass
    pub async fn process_now(&self) -> Result<SyncRunResult> {
        let queue = &self.parts.queue;
        let Some(_processing) = queue.try_begin_processing() else {
            tracing::debug!("Sync pass already running");
            return Ok(SyncRunResult::empty(
                RunDisposition::AlreadyProcessing,
                queue.len()?,
            ));
        };

        let network = self.parts.network.current_state();
        if !network.is_online {
            tracing::debug!("Offline; skipping sync pass");
            return Ok(SyncRunResult::empty(RunDisposition::Offline, queue.len()?));
        }

        let batch = queue.dequeue_batch(self.config.batch_size, network.quality())?;
        let mut result = SyncRunResult::empty(RunDisposition::Completed, 0);
        let mut blocked = HashSet::new();

        for operation in batch {
            let key = operation.record_key();
            // A failed or conflicting earlier operation holds back the rest of its chain
            if blocked.contains(&key) {
                continue;
            }

            let now = now_ms();
            self.update_status(&key, |status| begin_attempt(status, now))?;
            tracing::debug!(
                operation_id = %operation.id,
                record = %key,
                attempt = operation.attempts + 1,
                "Applying operation"
            );

            match self.apply_with_timeout(&operation).await {
                ApplyOutcome::Applied => {
                    queue.mark_attempted(&operation.id, AttemptOutcome::Succeeded)?;
                    self.mark_record_synced(&key)?;
                    result.processed += 1;
                }
                ApplyOutcome::Conflict(server) => {
                    blocked.insert(key);
                    result.conflicts += 1;
                    self.handle_conflict(&operation, &server)?;
                }
                ApplyOutcome::Failed(error) => {
                    blocked.insert(key);
                    result.errors.push(self.handle_failure(&operation, &error)?);
                }
            }
        }

        result.remaining = queue.len()?;
        result.success = result.processed > 0;
        result.finished_at = now_ms();

        tracing::info!(
            processed = result.processed,
            remaining = result.remaining,
            conflicts = result.conflicts,
            errors = result.errors.len(),
            "Sync pass finished"
        );

        {
            let mut state = self.state()?;
            if result.success {
                state.last_sync_at = Some(result.finished_at);
            }
            state.last_run = Some(result.clone());
        }
        self.bump();
        Ok(result)
    }

    async fn apply_with_timeout(&self, operation: &Operation) -> ApplyOutcome {
        match tokio::time::timeout(
            self.config.apply_timeout(),
            self.parts.backend.apply(operation),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ApplyOutcome::Failed(BackendError::Timeout(format!(
                "no response within {} ms",
                self.config.apply_timeout_ms
            ))),
        }
    }

    fn mark_record_synced(&self, key: &RecordKey) -> Result<()> {
        let now = now_ms();
        self.update_status(key, |status| status.mark_synced(now))?;
        if self.parts.queue.has_pending_for(key)? {
            self.update_status(key, RecordSyncStatus::mark_pending)?;
        }
        Ok(())
    }

    fn handle_conflict(&self, operation: &Operation, server: &ServerVersion) -> Result<()> {
        self.parts.queue.remove(&operation.id)?;
        let key = operation.record_key();
        self.update_status(&key, |status| status.mark_conflict(server.data.clone()))?;

        let conflict = self.parts.resolver.handle(operation, server)?;
        if conflict.is_resolved() {
            self.follow_up(&conflict)?;
        }
        Ok(())
    }

    fn handle_failure(&self, operation: &Operation, error: &BackendError) -> Result<SyncErrorEntry> {
        let key = operation.record_key();
        let message = error.to_string();
        let retryable = error.is_retryable();

        let disposition = self.parts.queue.mark_attempted(
            &operation.id,
            AttemptOutcome::Failed {
                error: message.clone(),
                retryable,
            },
        )?;

        match disposition {
            AttemptDisposition::Retrying {
                attempts,
                next_attempt_at,
            } => {
                tracing::warn!(
                    operation_id = %operation.id,
                    attempt = attempts,
                    next_attempt_at,
                    error = %message,
                    "Operation failed; will retry"
                );
                self.update_status(&key, |status| {
                    status.mark_failed(message.clone(), attempts)?;
                    status.mark_requeued()
                })?;
            }
            AttemptDisposition::Failed(failed) => {
                self.update_status(&key, |status| {
                    status.mark_failed(message.clone(), failed.operation.attempts)
                })?;
                self.roll_back(&failed)?;
            }
            AttemptDisposition::Removed | AttemptDisposition::NotQueued => {
                tracing::debug!(operation_id = %operation.id, "Operation left the queue mid-pass");
            }
        }

        Ok(SyncErrorEntry {
            id: operation.id.clone(),
            operation: operation.clone(),
            error: message,
            timestamp: now_ms(),
            retryable,
        })
    }

    /// Undo the optimistic replica write of a terminally failed operation
    ///
    /// When a later operation on the same record is still queued, the replica
    /// already holds that newer change; it is left alone and the successor
    /// inherits the failed operation's pre-image instead.
    fn roll_back(&self, failed: &FailedOperation) -> Result<()> {
        let operation = &failed.operation;
        let key = operation.record_key();
        if let Some(successor) = self.parts.queue.rebase_successor(
            &key,
            operation.sequence,
            operation.prior_state.clone(),
        )? {
            tracing::info!(
                operation_id = %operation.id,
                successor_id = %successor,
                record = %key,
                "Kept newer local change; successor takes over rollback state"
            );
            return Ok(());
        }

        LocalMutation::from_operation(operation)
            .inverse()
            .apply(self.parts.replica.as_ref())?;
        tracing::info!(
            operation_id = %operation.id,
            record = %key,
            "Rolled back local change"
        );
        Ok(())
    }

    /// Carry out a settled conflict's decision
    fn follow_up(&self, conflict: &Conflict) -> Result<()> {
        let Some(resolution) = conflict.resolution else {
            return Ok(());
        };
        let key = conflict.record_key();
        let winner = conflict.winning_version().cloned().unwrap_or(Value::Null);

        if resolution == Resolution::ServerWins {
            write_replica(self.parts.replica.as_ref(), &key, &winner)?;
            self.mark_record_synced(&key)?;
            return Ok(());
        }

        // Local or merged version wins: push it over the server copy
        let prior_state = Some(conflict.server_version.clone());
        let new = if winner.is_null() {
            NewOperation::delete(&key.table, &key.record_id)
        } else {
            NewOperation::update(&key.table, &key.record_id, winner.clone())
        };
        write_replica(self.parts.replica.as_ref(), &key, &winner)?;
        let operation = self.parts.queue.enqueue(
            new.with_priority(conflict.priority)
                .with_prior_state(prior_state)
                .overwriting(),
        )?;
        self.update_status(&key, note_local_change)?;
        tracing::debug!(
            operation_id = %operation.id,
            conflict_id = %conflict.id,
            "Queued overwrite for resolved conflict"
        );
        Ok(())
    }

    /// Settle a conflict by user decision and carry it out
    pub fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged: Option<Value>,
    ) -> Result<Conflict> {
        let conflict = self.parts.resolver.resolve_manually(id, resolution, merged)?;
        self.follow_up(&conflict)?;
        self.bump();
        Ok(conflict)
    }

    /// Entry point for server-originated changes
    pub fn apply_remote_change(&self, change: RemoteChange) -> Result<RemoteChangeOutcome> {
        let key = RecordKey::new(&change.table, &change.record_id);
        if self.parts.queue.has_pending_for(&key)?
            || self.parts.resolver.unresolved_for(&key)?.is_some()
        {
            tracing::debug!(record = %key, "Deferring remote change behind local work");
            return Ok(RemoteChangeOutcome::Deferred);
        }

        let data = change.data.unwrap_or(Value::Null);
        write_replica(self.parts.replica.as_ref(), &key, &data)?;

        let now = now_ms();
        self.update_status(&key, |status| {
            if status.status == SyncState::Synced || status.status == SyncState::Failed {
                status.mark_synced(now)
            } else {
                // No local work is in flight, so any other state is stale
                *status = RecordSyncStatus {
                    status: SyncState::Synced,
                    last_sync_success: Some(now),
                    ..RecordSyncStatus::pending(status.key.clone())
                };
                Ok(())
            }
        })?;
        Ok(RemoteChangeOutcome::Applied)
    }

    /// Move a failed operation back into the queue and re-apply its local change
    pub fn retry_failed(&self, id: &OperationId) -> Result<Operation> {
        let operation = self.parts.queue.retry_failed(id)?;
        let mutation = LocalMutation::from_operation(&operation);
        // A newer queued change on the record stays visible; it now builds on this one
        let successor = self.parts.queue.rebase_successor(
            &operation.record_key(),
            operation.sequence,
            mutation.after.clone(),
        )?;
        if successor.is_none() {
            mutation.apply(self.parts.replica.as_ref())?;
        }
        self.update_status(&operation.record_key(), note_local_change)?;
        Ok(operation)
    }

    /// Discard all pending operations
    pub fn reset_queue(&self) -> Result<usize> {
        let discarded = self.parts.queue.reset()?;
        self.bump();
        Ok(discarded)
    }

    pub fn phase(&self) -> Result<SyncPhase> {
        if self.parts.queue.is_processing() {
            return Ok(SyncPhase::Processing);
        }
        Ok(match self.parts.queue.next_retry_after(now_ms())? {
            Some(until) => SyncPhase::BackoffWait { until },
            None => SyncPhase::Idle,
        })
    }

    pub fn record_status(&self, key: &RecordKey) -> Result<Option<RecordSyncStatus>> {
        Ok(self.state()?.statuses.get(key).cloned())
    }

    pub fn record_statuses(&self) -> Result<Vec<RecordSyncStatus>> {
        Ok(self.state()?.statuses.values().cloned().collect())
    }

    /// Result of the last pass that ran
    pub fn last_run(&self) -> Result<Option<SyncRunResult>> {
        Ok(self.state()?.last_run.clone())
    }

    /// When a pass last applied at least one operation
    pub fn last_sync_at(&self) -> Result<Option<i64>> {
        Ok(self.state()?.last_sync_at)
    }

    /// Spawn the background driver; requires a Tokio runtime
    pub fn start(self: &Arc<Self>) -> SyncDriver {
        SyncDriver::spawn(Arc::clone(self))
    }

    /// Apply a status transition and persist it
    ///
    /// Illegal transitions are logged and leave the status unchanged.
    fn update_status<F>(&self, key: &RecordKey, change: F) -> Result<()>
    where
        F: FnOnce(&mut RecordSyncStatus) -> Result<()>,
    {
        {
            let mut state = self.state()?;
            let mut status = state
                .statuses
                .get(key)
                .cloned()
                .unwrap_or_else(|| RecordSyncStatus::pending(key.clone()));
            if let Err(error) = change(&mut status) {
                tracing::warn!(record = %key, %error, "Ignoring sync status change");
                return Ok(());
            }
            lock_store(&self.store)?.save_status(&status)?;
            state.statuses.insert(key.clone(), status);
        }
        self.bump();
        Ok(())
    }
}

/// A new local operation targets the record
fn note_local_change(status: &mut RecordSyncStatus) -> Result<()> {
    match status.status {
        // The in-flight attempt will notice the queued follow-up
        SyncState::Pending | SyncState::Syncing => Ok(()),
        SyncState::Failed => status.reset_retries(),
        SyncState::Synced | SyncState::Conflict => status.mark_pending(),
    }
}

/// Move a record to `syncing` for an attempt of its oldest operation
fn begin_attempt(status: &mut RecordSyncStatus, now: i64) -> Result<()> {
    match status.status {
        SyncState::Pending => {}
        SyncState::Failed => status.reset_retries()?,
        SyncState::Synced | SyncState::Conflict => status.mark_pending()?,
        SyncState::Syncing => return Ok(()),
    }
    status.mark_syncing(now)
}

fn write_replica(replica: &dyn LocalReplica, key: &RecordKey, data: &Value) -> Result<()> {
    if data.is_null() {
        replica.remove(&key.table, &key.record_id)
    } else {
        replica.put(&key.table, &key.record_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::models::{FailureReason, NetworkState, Priority, MAX_ATTEMPTS};
    use crate::replica::MemoryReplica;
    use crate::store::{shared_store, MemoryStore, SyncStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        manager: SyncManager,
        backend: Arc<MemoryBackend>,
    }

    fn immediate_config() -> SyncConfig {
        SyncConfig {
            backoff_schedule_ms: vec![0],
            ..SyncConfig::default()
        }
    }

    fn harness_with_store(config: SyncConfig, store: SharedStore) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let parts = SyncParts {
            queue: Arc::new(OperationQueue::open(store.clone(), config.retry_policy()).unwrap()),
            resolver: Arc::new(ConflictResolver::open(store.clone(), &config).unwrap()),
            network: Arc::new(NetworkMonitor::new()),
            backend: backend.clone(),
            replica: Arc::new(MemoryReplica::new()),
        };
        Harness {
            manager: SyncManager::new(config, store, parts).unwrap(),
            backend,
        }
    }

    fn harness(config: SyncConfig) -> Harness {
        harness_with_store(config, shared_store(MemoryStore::new()))
    }

    fn key(record: &str) -> RecordKey {
        RecordKey::new("exercises", record)
    }

    fn state_of(manager: &SyncManager, record: &str) -> SyncState {
        manager.record_status(&key(record)).unwrap().unwrap().status
    }

    /// Local update of a record the server already holds at `server_stamp`
    fn diverged(h: &Harness, server_stamp: i64, local_stamp: i64) {
        h.backend.seed(
            "exercises",
            "ex-1",
            json!({"name": "server", "updated_at": server_stamp}),
        );
        let prior = json!({"name": "base", "updated_at": 1_000});
        let local = json!({"name": "local", "updated_at": local_stamp});
        h.manager.replica().put("exercises", "ex-1", &local).unwrap();
        h.manager
            .enqueue(NewOperation::update("exercises", "ex-1", local).with_prior_state(Some(prior)))
            .unwrap();
    }

    #[tokio::test]
    async fn test_applied_operation_marks_record_synced() {
        let h = harness(SyncConfig::default());
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "Squat"})))
            .unwrap();
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Pending);

        let result = h.manager.process_now().await.unwrap();
        assert!(result.success);
        assert_eq!(result.processed, 1);
        assert_eq!(result.disposition, RunDisposition::Completed);
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Synced);
        assert_eq!(h.manager.last_sync_at().unwrap(), Some(result.finished_at));
        assert_eq!(h.manager.last_run().unwrap(), Some(result));
    }

    #[tokio::test]
    async fn test_offline_pass_is_a_no_op() {
        let h = harness(SyncConfig::default());
        h.manager.network().update(NetworkState::offline());
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "Squat"})))
            .unwrap();

        let result = h.manager.process_now().await.unwrap();
        assert_eq!(result.disposition, RunDisposition::Offline);
        assert_eq!(result.processed, 0);
        assert_eq!(result.remaining, 1);
        assert_eq!(h.backend.apply_count(), 0);
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_passes_do_not_overlap() {
        let h = harness(SyncConfig::default());
        h.backend.set_latency(Duration::from_millis(50));
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "Squat"})))
            .unwrap();

        let (first, second) = tokio::join!(h.manager.process_now(), h.manager.process_now());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.processed, 1);
        assert!(second.already_processing());
        assert_eq!(h.backend.apply_count(), 1);
        assert!(!h.manager.queue().is_processing());
    }

    #[tokio::test]
    async fn test_retryable_failures_stop_at_attempt_budget() {
        let h = harness(immediate_config());
        h.backend.fail_next(
            "ex-1",
            BackendError::Unavailable("503".to_string()),
            usize::try_from(MAX_ATTEMPTS).unwrap() + 3,
        );
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "Squat"})))
            .unwrap();

        for attempt in 1..=MAX_ATTEMPTS {
            let result = h.manager.process_now().await.unwrap();
            assert_eq!(result.errors.len(), 1, "attempt {attempt}");
            assert!(result.errors[0].retryable);
        }

        assert!(h.manager.queue().is_empty().unwrap());
        let failed = h.manager.queue().failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].operation.attempts, MAX_ATTEMPTS);
        assert_eq!(failed[0].reason, FailureReason::Exhausted);

        let status = h.manager.record_status(&key("ex-1")).unwrap().unwrap();
        assert_eq!(status.status, SyncState::Failed);
        assert_eq!(status.retry_count, MAX_ATTEMPTS);

        // Nothing left to attempt
        let result = h.manager.process_now().await.unwrap();
        assert_eq!(result.processed, 0);
        assert_eq!(h.backend.apply_count(), usize::try_from(MAX_ATTEMPTS).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_create_is_rolled_back() {
        let h = harness(SyncConfig::default());
        h.backend
            .fail_next("ex-1", BackendError::Rejected("bad row".to_string()), 1);
        let payload = json!({"name": "Squat"});
        h.manager.replica().put("exercises", "ex-1", &payload).unwrap();
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", payload))
            .unwrap();

        let result = h.manager.process_now().await.unwrap();
        assert!(!result.errors[0].retryable);
        assert_eq!(h.manager.replica().get("exercises", "ex-1").unwrap(), None);

        let failed = h.manager.queue().failed().unwrap();
        assert_eq!(failed[0].reason, FailureReason::Rejected);
        assert_eq!(failed[0].operation.attempts, 0);
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Failed);
        let status = h
            .manager
            .record_status(&RecordKey::new("exercises", "ex-1"))
            .unwrap()
            .unwrap();
        assert_eq!(status.retry_count, 0);
    }

    #[tokio::test]
    async fn test_failure_holds_back_later_operations_on_same_record() {
        let h = harness(immediate_config());
        h.backend
            .fail_next("ex-1", BackendError::Network("reset".to_string()), 1);
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "a"})))
            .unwrap();
        h.manager
            .enqueue(NewOperation::update("exercises", "ex-1", json!({"name": "b"})))
            .unwrap();

        let first = h.manager.process_now().await.unwrap();
        assert_eq!(first.processed, 0);
        assert_eq!(h.backend.apply_count(), 1);

        let second = h.manager.process_now().await.unwrap();
        assert_eq!(second.processed, 2);
        assert_eq!(h.backend.record("exercises", "ex-1"), Some(json!({"name": "b"})));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_and_stays_queued() {
        let h = harness(SyncConfig {
            apply_timeout_ms: 10,
            ..SyncConfig::default()
        });
        h.backend.set_latency(Duration::from_millis(500));
        let op = h
            .manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "Squat"})))
            .unwrap();

        let result = h.manager.process_now().await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].retryable);
        assert!(result.errors[0].error.contains("timed out"));

        let queued = h.manager.queue().get(&op.id).unwrap().unwrap();
        assert_eq!(queued.attempts, 1);
        assert!(queued.next_attempt_at.is_some());
        assert!(matches!(
            h.manager.phase().unwrap(),
            SyncPhase::BackoffWait { .. }
        ));
    }

    #[tokio::test]
    async fn test_server_wins_conflict_updates_replica() {
        let h = harness(SyncConfig::default());
        diverged(&h, 2_000, 1_500);

        let result = h.manager.process_now().await.unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.processed, 0);

        assert_eq!(
            h.manager.replica().get("exercises", "ex-1").unwrap(),
            Some(json!({"name": "server", "updated_at": 2_000}))
        );
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Synced);
        assert!(h.manager.resolver().unresolved().unwrap().is_empty());
        assert!(h.manager.queue().is_empty().unwrap());

        let history = h.manager.resolver().history().unwrap();
        assert_eq!(history[0].resolution, Some(Resolution::ServerWins));
    }

    #[tokio::test]
    async fn test_local_wins_conflict_pushes_overwrite() {
        let h = harness(SyncConfig::default());
        diverged(&h, 2_000, 3_000);

        let result = h.manager.process_now().await.unwrap();
        assert_eq!(result.conflicts, 1);

        let pending = h.manager.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].overwrite);
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Pending);

        let result = h.manager.process_now().await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(
            h.backend.record("exercises", "ex-1"),
            Some(json!({"name": "local", "updated_at": 3_000}))
        );
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_manual_conflict_waits_for_user() {
        let h = harness(SyncConfig {
            auto_resolve_conflicts: false,
            ..SyncConfig::default()
        });
        diverged(&h, 2_000, 3_000);

        h.manager.process_now().await.unwrap();
        let unresolved = h.manager.resolver().unresolved().unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Conflict);

        let merged = json!({"name": "merged", "updated_at": 4_000});
        let conflict = h
            .manager
            .resolve_conflict(&unresolved[0].id, Resolution::Manual, Some(merged.clone()))
            .unwrap();
        assert_eq!(conflict.resolved_by, Some(crate::models::ResolvedBy::User));
        assert_eq!(
            h.manager.replica().get("exercises", "ex-1").unwrap(),
            Some(merged.clone())
        );

        h.manager.process_now().await.unwrap();
        assert_eq!(h.backend.record("exercises", "ex-1"), Some(merged));
    }

    #[tokio::test]
    async fn test_remote_change_deferred_behind_local_work() {
        let h = harness(SyncConfig::default());
        h.manager
            .enqueue(NewOperation::create("exercises", "ex-1", json!({"name": "local"})))
            .unwrap();

        let deferred = h
            .manager
            .apply_remote_change(RemoteChange {
                table: "exercises".to_string(),
                record_id: "ex-1".to_string(),
                data: Some(json!({"name": "remote"})),
            })
            .unwrap();
        assert_eq!(deferred, RemoteChangeOutcome::Deferred);

        let applied = h
            .manager
            .apply_remote_change(RemoteChange {
                table: "exercises".to_string(),
                record_id: "ex-2".to_string(),
                data: Some(json!({"name": "remote"})),
            })
            .unwrap();
        assert_eq!(applied, RemoteChangeOutcome::Applied);
        assert_eq!(
            h.manager.replica().get("exercises", "ex-2").unwrap(),
            Some(json!({"name": "remote"}))
        );
        assert_eq!(state_of(&h.manager, "ex-2"), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_remote_delete_removes_replica_record() {
        let h = harness(SyncConfig::default());
        h.manager
            .replica()
            .put("exercises", "ex-1", &json!({"name": "old"}))
            .unwrap();
        h.manager
            .apply_remote_change(RemoteChange {
                table: "exercises".to_string(),
                record_id: "ex-1".to_string(),
                data: None,
            })
            .unwrap();
        assert_eq!(h.manager.replica().get("exercises", "ex-1").unwrap(), None);
    }

    #[test]
    fn test_interrupted_sync_recovers_to_pending() {
        let store = shared_store(MemoryStore::new());
        {
            let mut status = RecordSyncStatus::pending(key("ex-1"));
            status.mark_syncing(1_000).unwrap();
            store.lock().unwrap().save_status(&status).unwrap();
        }

        let h = harness_with_store(SyncConfig::default(), store.clone());
        assert_eq!(state_of(&h.manager, "ex-1"), SyncState::Pending);
        let persisted = store.lock().unwrap().load_statuses().unwrap();
        assert_eq!(persisted[0].status, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_reset_queue_discards_pending() {
        let h = harness(SyncConfig::default());
        for record in ["a", "b"] {
            h.manager
                .enqueue(
                    NewOperation::create("exercises", record, json!({"name": record}))
                        .with_priority(Priority::Low),
                )
                .unwrap();
        }
        assert_eq!(h.manager.reset_queue().unwrap(), 2);
        assert!(h.manager.queue().is_empty().unwrap());
        assert_eq!(h.manager.phase().unwrap(), SyncPhase::Idle);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = shared_store(MemoryStore::new());
        let config = SyncConfig::default();
        let parts = SyncParts {
            queue: Arc::new(OperationQueue::in_memory(config.retry_policy())),
            resolver: Arc::new(ConflictResolver::open(store.clone(), &config).unwrap()),
            network: Arc::new(NetworkMonitor::new()),
            backend: Arc::new(MemoryBackend::new()),
            replica: Arc::new(MemoryReplica::new()),
        };
        let bad = SyncConfig {
            batch_size: 0,
            ..config
        };
        assert!(matches!(
            SyncManager::new(bad, store, parts),
            Err(Error::Config(_))
        ));
    }
}
