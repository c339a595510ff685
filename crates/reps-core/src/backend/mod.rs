//! Remote storage contract
//!
//! The sync manager only ever talks to a [`StorageBackend`]. Which service
//! sits behind it is irrelevant to queue draining; [`RestBackend`] speaks to a
//! PostgREST-style API and [`MemoryBackend`] simulates one in process.

mod memory;
mod rest;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{ConflictType, Operation};

/// Server-side copy of a record that disagreed with a local operation
#[derive(Debug, Clone, PartialEq)]
pub struct ServerVersion {
    /// `Value::Null` when the server no longer has the record
    pub data: Value,
    pub conflict_type: ConflictType,
}

/// Why a backend could not apply an operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("malformed operation: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Network-class failures are retried; validation-class failures are not
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

/// Result of applying one operation remotely
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    Conflict(ServerVersion),
    Failed(BackendError),
}

/// Vendor adapter that performs remote writes; the sole site of network I/O
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn apply(&self, operation: &Operation) -> ApplyOutcome;
}
