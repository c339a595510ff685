//! Durable, priority-ordered queue of pending operations
//!
//! Cross-record order is priority first (critical before low) and then enqueue
//! time. Operations on the same record form a FIFO chain: only the oldest one
//! is eligible, and it inherits the most urgent priority queued behind it so a
//! critical follow-up is never stuck behind an unrelated low-priority backlog.
//!
//! Every mutation is written through the [`SharedStore`] before the in-memory
//! view changes, so an `Ok` return means the change survives a restart.

mod retry;

pub use retry::RetryPolicy;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};

use crate::error::{Error, Result};
use crate::models::{
    FailedOperation, FailureReason, NetworkQuality, NewOperation, Operation, OperationId, Priority,
    RecordKey, MAX_ATTEMPTS,
};
use crate::store::{lock_store, shared_store, MemoryStore, SharedStore};
use crate::util::{duration_ms, now_ms};

/// Result of one apply attempt, as reported by the sync manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { error: String, retryable: bool },
}

/// What the queue did with an attempted operation
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptDisposition {
    /// Applied and removed
    Removed,
    /// Still queued, not eligible before `next_attempt_at`
    Retrying { attempts: u32, next_attempt_at: i64 },
    /// Moved out of the active queue
    Failed(FailedOperation),
    /// The id was not in the active queue
    NotQueued,
}

/// Read-only snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total_pending: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub is_processing: bool,
    pub failed: usize,
    pub next_retry_at: Option<i64>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Active operations in enqueue (sequence) order
    operations: Vec<Operation>,
    failed: Vec<FailedOperation>,
    next_sequence: u64,
}

/// The pending-operation queue shared by the engine's components
pub struct OperationQueue {
    store: SharedStore,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    processing: AtomicBool,
    enqueued: Notify,
    revision: watch::Sender<u64>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("policy", &self.policy)
            .field("processing", &self.processing)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Load the queue from `store`
    pub fn open(store: SharedStore, policy: RetryPolicy) -> Result<Self> {
        let (mut operations, mut failed) = {
            let store = lock_store(&store)?;
            (store.load_operations()?, store.load_failed()?)
        };
        operations.sort_by_key(|operation| operation.sequence);
        failed.sort_by_key(|record| record.failed_at);

        let next_sequence = operations
            .iter()
            .map(|operation| operation.sequence)
            .chain(failed.iter().map(|record| record.operation.sequence))
            .max()
            .map_or(0, |sequence| sequence + 1);

        tracing::debug!(
            pending = operations.len(),
            failed = failed.len(),
            "Loaded operation queue"
        );

        Ok(Self::from_parts(
            store,
            policy,
            QueueState {
                operations,
                failed,
                next_sequence,
            },
        ))
    }

    /// Empty queue backed by a [`MemoryStore`]
    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self::from_parts(
            shared_store(MemoryStore::new()),
            policy,
            QueueState::default(),
        )
    }

    fn from_parts(store: SharedStore, policy: RetryPolicy, state: QueueState) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            store,
            policy,
            state: Mutex::new(state),
            processing: AtomicBool::new(false),
            enqueued: Notify::new(),
            revision,
        }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::StoreUnavailable("operation queue lock poisoned".to_string()))
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    /// Append an operation; never blocks on an in-flight drain
    pub fn enqueue(&self, new: NewOperation) -> Result<Operation> {
        if new.target_table.trim().is_empty() {
            return Err(Error::InvalidInput("target table must not be empty".to_string()));
        }
        if new.record_id.trim().is_empty() {
            return Err(Error::InvalidInput("record id must not be empty".to_string()));
        }

        let operation = {
            let mut state = self.state()?;
            let operation = Operation::from_new(new, now_ms(), state.next_sequence);
            lock_store(&self.store)?.save_operation(&operation)?;
            state.next_sequence += 1;
            state.operations.push(operation.clone());
            operation
        };

        tracing::debug!(
            operation_id = %operation.id,
            kind = %operation.kind,
            record = %operation.record_key(),
            priority = %operation.priority,
            "Enqueued operation"
        );
        self.enqueued.notify_one();
        self.bump();
        Ok(operation)
    }

    /// Next operations to apply, without removing them
    pub fn dequeue_batch(&self, max_size: usize, quality: NetworkQuality) -> Result<Vec<Operation>> {
        self.dequeue_batch_at(max_size, quality, now_ms())
    }

    /// [`Self::dequeue_batch`] evaluated at a fixed clock reading
    pub fn dequeue_batch_at(
        &self,
        max_size: usize,
        quality: NetworkQuality,
        now: i64,
    ) -> Result<Vec<Operation>> {
        let limit = quality.batch_size(max_size);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.state()?;
        Ok(drain_order(&state.operations, now, limit))
    }

    /// Drop an operation from the active queue; absent ids are a no-op
    pub fn remove(&self, id: &OperationId) -> Result<bool> {
        let removed = {
            let mut state = self.state()?;
            let Some(index) = state.operations.iter().position(|op| &op.id == id) else {
                return Ok(false);
            };
            lock_store(&self.store)?.delete_operation(id)?;
            state.operations.remove(index);
            true
        };
        self.bump();
        Ok(removed)
    }

    /// Record the outcome of an apply attempt
    pub fn mark_attempted(&self, id: &OperationId, outcome: AttemptOutcome) -> Result<AttemptDisposition> {
        self.mark_attempted_at(id, outcome, now_ms())
    }

    /// [`Self::mark_attempted`] with an explicit clock reading
    pub fn mark_attempted_at(
        &self,
        id: &OperationId,
        outcome: AttemptOutcome,
        now: i64,
    ) -> Result<AttemptDisposition> {
        let disposition = {
            let mut state = self.state()?;
            let Some(index) = state.operations.iter().position(|op| &op.id == id) else {
                return Ok(AttemptDisposition::NotQueued);
            };

            match outcome {
                AttemptOutcome::Succeeded => {
                    lock_store(&self.store)?.delete_operation(id)?;
                    state.operations.remove(index);
                    AttemptDisposition::Removed
                }
                AttemptOutcome::Failed { error, retryable } => {
                    let mut operation = state.operations[index].clone();
                    // Non-retryable failures do not spend retry budget
                    if retryable {
                        operation.attempts = (operation.attempts + 1).min(MAX_ATTEMPTS);
                    }
                    operation.last_attempt_at = Some(now.max(operation.created_at));

                    let reason = if !retryable {
                        Some(FailureReason::Rejected)
                    } else if self.policy.is_exhausted(operation.attempts) {
                        Some(FailureReason::Exhausted)
                    } else {
                        None
                    };

                    if let Some(reason) = reason {
                        operation.next_attempt_at = None;
                        let failed = FailedOperation {
                            operation,
                            error,
                            reason,
                            failed_at: now,
                        };
                        lock_store(&self.store)?.move_to_failed(&failed)?;
                        state.operations.remove(index);
                        state.failed.push(failed.clone());
                        tracing::warn!(
                            operation_id = %id,
                            attempts = failed.operation.attempts,
                            reason = reason.as_str(),
                            "Operation moved to failed records"
                        );
                        AttemptDisposition::Failed(failed)
                    } else {
                        let delay = self.policy.delay_after(operation.attempts);
                        let next_attempt_at = now.saturating_add(duration_ms(delay));
                        operation.next_attempt_at = Some(next_attempt_at);
                        lock_store(&self.store)?.save_operation(&operation)?;
                        let attempts = operation.attempts;
                        state.operations[index] = operation;
                        AttemptDisposition::Retrying {
                            attempts,
                            next_attempt_at,
                        }
                    }
                }
            }
        };
        self.bump();
        Ok(disposition)
    }

    pub fn status(&self) -> Result<QueueStatus> {
        let state = self.state()?;
        let mut by_priority = Priority::ALL
            .into_iter()
            .map(|priority| (priority, 0))
            .collect::<BTreeMap<_, _>>();
        for operation in &state.operations {
            *by_priority.entry(operation.priority).or_default() += 1;
        }
        Ok(QueueStatus {
            total_pending: state.operations.len(),
            by_priority,
            is_processing: self.is_processing(),
            failed: state.failed.len(),
            next_retry_at: next_deadline(&state.operations),
        })
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state()?.operations.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, id: &OperationId) -> Result<Option<Operation>> {
        Ok(self
            .state()?
            .operations
            .iter()
            .find(|operation| &operation.id == id)
            .cloned())
    }

    /// Active operations in enqueue order
    pub fn pending(&self) -> Result<Vec<Operation>> {
        Ok(self.state()?.operations.clone())
    }

    /// Whether any active operation targets `key`
    pub fn has_pending_for(&self, key: &RecordKey) -> Result<bool> {
        Ok(self
            .state()?
            .operations
            .iter()
            .any(|operation| operation.target_table == key.table && operation.record_id == key.record_id))
    }

    /// Replace the pre-image of the first active operation on `key` queued after
    /// `after_sequence`, returning its id
    ///
    /// Used when an earlier operation in a record's chain leaves the queue
    /// without its change reaching the server, so the successor's rollback
    /// target stays accurate.
    pub fn rebase_successor(
        &self,
        key: &RecordKey,
        after_sequence: u64,
        prior_state: Option<Value>,
    ) -> Result<Option<OperationId>> {
        let mut state = self.state()?;
        let Some(successor) = state.operations.iter_mut().find(|operation| {
            operation.sequence > after_sequence
                && operation.target_table == key.table
                && operation.record_id == key.record_id
        }) else {
            return Ok(None);
        };

        let mut updated = successor.clone();
        updated.prior_state = prior_state;
        lock_store(&self.store)?.save_operation(&updated)?;
        let id = updated.id.clone();
        *successor = updated;
        Ok(Some(id))
    }

    /// Earliest backoff deadline among active operations
    pub fn next_retry_at(&self) -> Result<Option<i64>> {
        Ok(next_deadline(&self.state()?.operations))
    }

    /// Earliest backoff deadline strictly later than `after`
    pub fn next_retry_after(&self, after: i64) -> Result<Option<i64>> {
        Ok(self
            .state()?
            .operations
            .iter()
            .filter_map(|operation| operation.next_attempt_at)
            .filter(|deadline| *deadline > after)
            .min())
    }

    /// Terminal failure records, oldest first
    pub fn failed(&self) -> Result<Vec<FailedOperation>> {
        Ok(self.state()?.failed.clone())
    }

    /// Move a failed record back into the active queue with a fresh budget
    pub fn retry_failed(&self, id: &OperationId) -> Result<Operation> {
        let operation = {
            let mut state = self.state()?;
            let index = state
                .failed
                .iter()
                .position(|record| &record.operation.id == id)
                .ok_or_else(|| Error::NotFound(format!("failed operation {id}")))?;

            let mut operation = state.failed[index].operation.clone();
            operation.attempts = 0;
            operation.next_attempt_at = None;
            lock_store(&self.store)?.restore_failed(&operation)?;

            state.failed.remove(index);
            let position = state
                .operations
                .partition_point(|existing| existing.sequence < operation.sequence);
            state.operations.insert(position, operation.clone());
            operation
        };

        tracing::info!(operation_id = %id, "Requeued failed operation");
        self.enqueued.notify_one();
        self.bump();
        Ok(operation)
    }

    /// Discard every active operation and clear the processing flag
    ///
    /// This loses data by design of the caller; it is never invoked
    /// automatically.
    pub fn reset(&self) -> Result<usize> {
        let discarded = {
            let mut state = self.state()?;
            lock_store(&self.store)?.clear_operations()?;
            let discarded = state.operations.len();
            state.operations.clear();
            discarded
        };
        self.processing.store(false, Ordering::Release);
        tracing::warn!(discarded, "Operation queue reset");
        self.bump();
        Ok(discarded)
    }

    /// Claim the single processing slot, if free
    pub fn try_begin_processing(&self) -> Option<ProcessingGuard<'_>> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.bump();
        Some(ProcessingGuard { queue: self })
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Resolves after the next enqueue (or one that happened since the last call)
    pub async fn enqueued(&self) {
        self.enqueued.notified().await;
    }

    /// Receiver bumped on every queue change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Holds the processing slot; releasing happens on drop
#[derive(Debug)]
pub struct ProcessingGuard<'a> {
    queue: &'a OperationQueue,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.queue.processing.store(false, Ordering::Release);
        self.queue.bump();
    }
}

fn next_deadline(operations: &[Operation]) -> Option<i64> {
    operations
        .iter()
        .filter_map(|operation| operation.next_attempt_at)
        .min()
}

type ChainRank = (Priority, i64, u64);

/// Rank of a chain's head: most urgent priority left in the chain, then the
/// head's age
fn chain_rank(chain: &VecDeque<&Operation>) -> Option<ChainRank> {
    let head = chain.front()?;
    let priority = chain.iter().map(|operation| operation.priority).min()?;
    Some((priority, head.created_at, head.sequence))
}

/// Select up to `limit` eligible operations in apply order
fn drain_order(operations: &[Operation], now: i64, limit: usize) -> Vec<Operation> {
    let mut chains: BTreeMap<RecordKey, VecDeque<&Operation>> = BTreeMap::new();
    for operation in operations {
        chains
            .entry(operation.record_key())
            .or_default()
            .push_back(operation);
    }

    let mut heads = BinaryHeap::new();
    for (key, chain) in &chains {
        if chain.front().is_some_and(|head| head.is_due(now)) {
            if let Some(rank) = chain_rank(chain) {
                heads.push(Reverse((rank, key.clone())));
            }
        }
    }

    let mut batch = Vec::with_capacity(limit.min(operations.len()));
    while batch.len() < limit {
        let Some(Reverse((_, key))) = heads.pop() else {
            break;
        };
        let Some(chain) = chains.get_mut(&key) else {
            continue;
        };
        let Some(operation) = chain.pop_front() else {
            continue;
        };
        batch.push(operation.clone());

        if chain.front().is_some_and(|next| next.is_due(now)) {
            if let Some(rank) = chain_rank(chain) {
                heads.push(Reverse((rank, key)));
            }
        }
    }
    batch
}
