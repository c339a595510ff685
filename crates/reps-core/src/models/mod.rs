//! Data models for Reps

mod conflict;
mod exercise;
mod network;
mod operation;
mod sync_status;

pub use conflict::{Conflict, ConflictId, ConflictType, ResolvedBy, Resolution};
pub use exercise::{Exercise, ExerciseId, EXERCISES_TABLE};
pub use network::{ConnectionType, NetworkQuality, NetworkState};
pub use operation::{
    FailedOperation, FailureReason, NewOperation, Operation, OperationId, OperationKind, Priority,
    RecordKey, MAX_ATTEMPTS,
};
pub use sync_status::{RecordSyncStatus, SyncState};
