//! reps-core - Core library for Reps
//!
//! This crate contains the exercise models, local persistence, and the
//! offline-first sync engine: a durable priority queue of pending mutations,
//! conflict detection and resolution, network awareness, and the manager that
//! drains the queue against a remote storage backend.

pub mod backend;
pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod mutation;
pub mod network;
pub mod notify;
pub mod queue;
pub mod replica;
pub mod store;
pub mod sync;
pub mod util;

pub use backend::{ApplyOutcome, BackendError, MemoryBackend, RestBackend, StorageBackend};
pub use config::{BackendConfig, SyncConfig};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use models::{Exercise, ExerciseId, NewOperation, Operation, OperationId, Priority};
pub use sync::{SyncRunResult, SyncStatus};
