//! Queued mutation model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Upper bound on apply attempts for a single operation
pub const MAX_ATTEMPTS: u32 = 5;

/// Opaque identifier assigned to an operation at enqueue time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Create a new unique operation ID (UUID v7, time-sortable)
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Borrow the string form of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind '{other}'"))),
        }
    }
}

/// Drain priority. The derived ordering is the drain order: `Critical` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All priorities in drain order
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(Error::InvalidInput(format!("unknown priority '{other}'"))),
        }
    }
}

/// Identity of a record across the local replica and the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.record_id)
    }
}

/// A mutation as submitted by the caller, before the queue stamps it
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub target_table: String,
    pub record_id: String,
    pub payload: Value,
    pub priority: Priority,
    /// Caller grouping tag, forwarded to the backend untouched
    pub batch_id: Option<String>,
    /// Local pre-image of the record, used to roll back on terminal failure
    pub prior_state: Option<Value>,
    /// Apply unconditionally, skipping remote conflict detection
    pub overwrite: bool,
}

impl NewOperation {
    fn new(
        kind: OperationKind,
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            target_table: table.into(),
            record_id: record_id.into(),
            payload,
            priority: Priority::default(),
            batch_id: None,
            prior_state: None,
            overwrite: false,
        }
    }

    pub fn create(table: impl Into<String>, record_id: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Create, table, record_id, payload)
    }

    pub fn update(table: impl Into<String>, record_id: impl Into<String>, payload: Value) -> Self {
        Self::new(OperationKind::Update, table, record_id, payload)
    }

    pub fn delete(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, table, record_id, Value::Null)
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    #[must_use]
    pub fn with_prior_state(mut self, prior_state: Option<Value>) -> Self {
        self.prior_state = prior_state;
        self
    }

    #[must_use]
    pub const fn overwriting(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

/// A queued mutation awaiting application to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub target_table: String,
    pub record_id: String,
    pub payload: Value,
    pub priority: Priority,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    /// Prior apply attempts, `0..=MAX_ATTEMPTS`
    pub attempts: u32,
    /// Most recent attempt (Unix ms), never earlier than `created_at`
    pub last_attempt_at: Option<i64>,
    /// Backoff deadline (Unix ms); the operation is not dequeued before it
    pub next_attempt_at: Option<i64>,
    /// Caller grouping tag; does not affect drain order
    pub batch_id: Option<String>,
    pub prior_state: Option<Value>,
    pub overwrite: bool,
    /// Queue-local enqueue counter, breaks `created_at` ties
    pub sequence: u64,
}

impl Operation {
    pub(crate) fn from_new(new: NewOperation, created_at: i64, sequence: u64) -> Self {
        Self {
            id: OperationId::new(),
            kind: new.kind,
            target_table: new.target_table,
            record_id: new.record_id,
            payload: new.payload,
            priority: new.priority,
            created_at,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            batch_id: new.batch_id,
            prior_state: new.prior_state,
            overwrite: new.overwrite,
            sequence,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.target_table, &self.record_id)
    }

    /// Whether the backoff deadline (if any) has passed at `now_ms`
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_attempt_at.is_none_or(|deadline| deadline <= now_ms)
    }
}

/// Why an operation left the active queue without being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Retryable failures used up the attempt budget
    Exhausted,
    /// The backend rejected the operation as invalid
    Rejected,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for FailureReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exhausted" => Ok(Self::Exhausted),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::InvalidInput(format!("unknown failure reason '{other}'"))),
        }
    }
}

/// Terminal record for an operation that will not be retried automatically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation: Operation,
    pub error: String,
    pub reason: FailureReason,
    pub failed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_order_matches_drain_order() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        priorities.sort();
        assert_eq!(priorities, Priority::ALL.to_vec());
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn operation_kind_serializes_lowercase() {
        let json = serde_json::to_string(&OperationKind::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
        assert_eq!("update".parse::<OperationKind>().unwrap(), OperationKind::Update);
    }

    #[test]
    fn new_operation_builder_sets_fields() {
        let new = NewOperation::update("exercises", "ex-1", json!({"name": "Squat"}))
            .with_priority(Priority::High)
            .with_batch("batch-1")
            .overwriting();
        let op = Operation::from_new(new, 1_000, 7);

        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.priority, Priority::High);
        assert_eq!(op.batch_id.as_deref(), Some("batch-1"));
        assert!(op.overwrite);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.created_at, 1_000);
        assert_eq!(op.sequence, 7);
        assert_eq!(op.record_key().to_string(), "exercises/ex-1");
    }

    #[test]
    fn is_due_respects_backoff_deadline() {
        let mut op = Operation::from_new(NewOperation::delete("exercises", "ex-1"), 0, 0);
        assert!(op.is_due(0));
        op.next_attempt_at = Some(500);
        assert!(!op.is_due(499));
        assert!(op.is_due(500));
    }

    #[test]
    fn operation_ids_are_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
    }
}
