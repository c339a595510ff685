//! Reversible local mutations
//!
//! A queued operation is applied to the [`LocalReplica`] optimistically. If the
//! operation later fails terminally, the inverse command restores the pre-image
//! carried in [`Operation::prior_state`].

use serde_json::Value;

use crate::error::Result;
use crate::models::{Operation, OperationKind};
use crate::replica::LocalReplica;

/// A change to one replica record, expressed as before/after images
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMutation {
    pub table: String,
    pub record_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl LocalMutation {
    /// Reconstruct the mutation an operation made to the replica
    pub fn from_operation(operation: &Operation) -> Self {
        let after = match operation.kind {
            OperationKind::Delete => None,
            OperationKind::Create | OperationKind::Update => Some(operation.payload.clone()),
        };
        Self {
            table: operation.target_table.clone(),
            record_id: operation.record_id.clone(),
            before: operation.prior_state.clone(),
            after,
        }
    }

    /// The command that undoes this one
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            table: self.table.clone(),
            record_id: self.record_id.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }

    pub fn apply(&self, replica: &dyn LocalReplica) -> Result<()> {
        match &self.after {
            Some(value) => replica.put(&self.table, &self.record_id, value),
            None => replica.remove(&self.table, &self.record_id),
        }
    }
}
