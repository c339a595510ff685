//! Persistence contract for queue, status and conflict state
//!
//! Every write method must be durable when it returns: the queue, the sync
//! manager and the conflict resolver call through this trait before updating
//! their in-memory view. [`MemoryStore`] keeps everything in process;
//! [`crate::db::SqliteSyncStore`] survives restarts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, FailedOperation, Operation, OperationId, RecordKey, RecordSyncStatus,
};

/// Durable storage for sync engine state
pub trait SyncStore: Send {
    /// All operations in the active queue
    fn load_operations(&self) -> Result<Vec<Operation>>;

    /// Insert or replace an active operation
    fn save_operation(&mut self, operation: &Operation) -> Result<()>;

    /// Remove an active operation; absent ids are a no-op
    fn delete_operation(&mut self, id: &OperationId) -> Result<()>;

    /// Remove every active operation
    fn clear_operations(&mut self) -> Result<()>;

    /// Terminal failure records
    fn load_failed(&self) -> Result<Vec<FailedOperation>>;

    fn save_failed(&mut self, failed: &FailedOperation) -> Result<()>;

    fn delete_failed(&mut self, id: &OperationId) -> Result<()>;

    /// Move an operation from the active queue to the failed records
    fn move_to_failed(&mut self, failed: &FailedOperation) -> Result<()> {
        self.delete_operation(&failed.operation.id)?;
        self.save_failed(failed)
    }

    /// Move a failed record back into the active queue
    fn restore_failed(&mut self, operation: &Operation) -> Result<()> {
        self.delete_failed(&operation.id)?;
        self.save_operation(operation)
    }

    fn load_statuses(&self) -> Result<Vec<RecordSyncStatus>>;

    fn save_status(&mut self, status: &RecordSyncStatus) -> Result<()>;

    /// Unresolved conflicts only
    fn load_conflicts(&self) -> Result<Vec<Conflict>>;

    fn save_conflict(&mut self, conflict: &Conflict) -> Result<()>;

    fn delete_conflict(&mut self, id: &ConflictId) -> Result<()>;
}

/// Store handle shared by the queue, manager and resolver
pub type SharedStore = Arc<Mutex<dyn SyncStore>>;

/// Wrap a store for sharing between components
pub fn shared_store<S: SyncStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

pub(crate) fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, dyn SyncStore + 'static>> {
    store
        .lock()
        .map_err(|_| Error::StoreUnavailable("sync store lock poisoned".to_string()))
}

/// In-process store; state is lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStore {
    operations: BTreeMap<OperationId, Operation>,
    failed: BTreeMap<OperationId, FailedOperation>,
    statuses: BTreeMap<RecordKey, RecordSyncStatus>,
    conflicts: Vec<Conflict>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStore for MemoryStore {
    fn load_operations(&self) -> Result<Vec<Operation>> {
        Ok(self.operations.values().cloned().collect())
    }

    fn save_operation(&mut self, operation: &Operation) -> Result<()> {
        self.operations
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    fn delete_operation(&mut self, id: &OperationId) -> Result<()> {
        self.operations.remove(id);
        Ok(())
    }

    fn clear_operations(&mut self) -> Result<()> {
        self.operations.clear();
        Ok(())
    }

    fn load_failed(&self) -> Result<Vec<FailedOperation>> {
        Ok(self.failed.values().cloned().collect())
    }

    fn save_failed(&mut self, failed: &FailedOperation) -> Result<()> {
        self.failed
            .insert(failed.operation.id.clone(), failed.clone());
        Ok(())
    }

    fn delete_failed(&mut self, id: &OperationId) -> Result<()> {
        self.failed.remove(id);
        Ok(())
    }

    fn load_statuses(&self) -> Result<Vec<RecordSyncStatus>> {
        Ok(self.statuses.values().cloned().collect())
    }

    fn save_status(&mut self, status: &RecordSyncStatus) -> Result<()> {
        self.statuses.insert(status.key.clone(), status.clone());
        Ok(())
    }

    fn load_conflicts(&self) -> Result<Vec<Conflict>> {
        Ok(self.conflicts.clone())
    }

    fn save_conflict(&mut self, conflict: &Conflict) -> Result<()> {
        self.conflicts.retain(|existing| {
            existing.id != conflict.id
                && !(existing.table_name == conflict.table_name
                    && existing.record_id == conflict.record_id)
        });
        self.conflicts.push(conflict.clone());
        Ok(())
    }

    fn delete_conflict(&mut self, id: &ConflictId) -> Result<()> {
        self.conflicts.retain(|existing| &existing.id != id);
        Ok(())
    }
}
