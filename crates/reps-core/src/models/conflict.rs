//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::operation::{OperationId, OperationKind, Priority, RecordKey};
use crate::error::{Error, Result};

/// Identifier of a detected conflict
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(String);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConflictId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConflictId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How the local and server copies diverged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentUpdate,
    DeleteConflict,
    SchemaMismatch,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConcurrentUpdate => "concurrent_update",
            Self::DeleteConflict => "delete_conflict",
            Self::SchemaMismatch => "schema_mismatch",
        }
    }
}

impl FromStr for ConflictType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "concurrent_update" => Ok(Self::ConcurrentUpdate),
            "delete_conflict" => Ok(Self::DeleteConflict),
            "schema_mismatch" => Ok(Self::SchemaMismatch),
            other => Err(Error::InvalidInput(format!("unknown conflict type '{other}'"))),
        }
    }
}

/// Outcome chosen for a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    ServerWins,
    Merged,
    /// A user-supplied record replaces both versions
    Manual,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::ServerWins => "server_wins",
            Self::Merged => "merged",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local_wins" | "local" => Ok(Self::LocalWins),
            "server_wins" | "server" => Ok(Self::ServerWins),
            "merged" => Ok(Self::Merged),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!("unknown resolution '{other}'"))),
        }
    }
}

/// Who settled a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    System,
    User,
}

impl ResolvedBy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

impl FromStr for ResolvedBy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            other => Err(Error::InvalidInput(format!("unknown resolver '{other}'"))),
        }
    }
}

/// Divergence between the local and server copy of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub table_name: String,
    pub record_id: String,
    pub local_version: Value,
    pub server_version: Value,
    pub conflict_type: ConflictType,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<ResolvedBy>,
    /// Operation whose apply surfaced the conflict
    pub operation_id: OperationId,
    pub operation_kind: OperationKind,
    pub priority: Priority,
    /// Resolved record when `resolution` is `Merged` or `Manual`
    pub merged_version: Option<Value>,
}

impl Conflict {
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.table_name, &self.record_id)
    }

    pub const fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Settle the conflict; `resolved_at` is clamped so it never precedes `detected_at`
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        resolved_by: ResolvedBy,
        merged_version: Option<Value>,
        now_ms: i64,
    ) -> Result<()> {
        if self.is_resolved() {
            return Err(Error::InvalidInput(format!(
                "conflict {} is already resolved",
                self.id
            )));
        }
        if matches!(resolution, Resolution::Merged | Resolution::Manual) && merged_version.is_none()
        {
            return Err(Error::InvalidInput(format!(
                "{} resolution requires a record",
                resolution.as_str()
            )));
        }
        self.resolution = Some(resolution);
        self.resolved_by = Some(resolved_by);
        self.resolved_at = Some(now_ms.max(self.detected_at));
        self.merged_version = merged_version;
        Ok(())
    }

    /// Record the resolution settled on; `Value::Null` means deleted
    pub fn winning_version(&self) -> Option<&Value> {
        match self.resolution? {
            Resolution::LocalWins => Some(&self.local_version),
            Resolution::ServerWins => Some(&self.server_version),
            Resolution::Merged | Resolution::Manual => self.merged_version.as_ref(),
        }
    }

    /// Check the paired resolution invariants
    pub fn validate(&self) -> Result<()> {
        let resolution_set = self.resolution.is_some();
        if resolution_set != self.resolved_by.is_some() {
            return Err(Error::InvalidInput(format!(
                "conflict {}: resolution and resolved_by must be set together",
                self.id
            )));
        }
        if resolution_set != self.resolved_at.is_some() {
            return Err(Error::InvalidInput(format!(
                "conflict {}: resolved_at must be set iff resolved",
                self.id
            )));
        }
        if let Some(resolved_at) = self.resolved_at {
            if resolved_at < self.detected_at {
                return Err(Error::InvalidInput(format!(
                    "conflict {}: resolved_at precedes detected_at",
                    self.id
                )));
            }
        }
        Ok(())
    }
}
