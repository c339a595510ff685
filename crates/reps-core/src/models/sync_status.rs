//! Per-record sync state

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::operation::{RecordKey, MAX_ATTEMPTS};
use crate::error::{Error, Result};

/// Sync lifecycle of a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }

    /// Whether `self -> next` is a legal transition
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending | Self::Syncing)
                | (Self::Syncing, Self::Synced | Self::Failed | Self::Conflict)
                | (Self::Failed, Self::Pending | Self::Synced)
                | (Self::Synced, Self::Pending | Self::Synced)
                | (Self::Conflict, Self::Pending | Self::Synced | Self::Conflict)
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync state '{other}'"))),
        }
    }
}

/// Sync bookkeeping for one record
///
/// `error_message` is only set while `Failed`; `conflict_version` only while `Conflict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSyncStatus {
    pub key: RecordKey,
    pub status: SyncState,
    pub last_sync_attempt: Option<i64>,
    pub last_sync_success: Option<i64>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub conflict_version: Option<Value>,
}

impl RecordSyncStatus {
    /// Fresh status for a record with a newly queued local change
    pub const fn pending(key: RecordKey) -> Self {
        Self {
            key,
            status: SyncState::Pending,
            last_sync_attempt: None,
            last_sync_success: None,
            retry_count: 0,
            error_message: None,
            conflict_version: None,
        }
    }

    fn transition(&mut self, next: SyncState) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "illegal sync transition {} -> {} for {}",
                self.status, next, self.key
            )));
        }
        self.status = next;
        if next != SyncState::Failed {
            self.error_message = None;
        }
        if next != SyncState::Conflict {
            self.conflict_version = None;
        }
        Ok(())
    }

    /// A new local change (or a retry) put the record back in the queue
    pub fn mark_pending(&mut self) -> Result<()> {
        self.transition(SyncState::Pending)
    }

    pub fn mark_syncing(&mut self, now_ms: i64) -> Result<()> {
        self.transition(SyncState::Syncing)?;
        self.last_sync_attempt = Some(now_ms);
        Ok(())
    }

    pub fn mark_synced(&mut self, now_ms: i64) -> Result<()> {
        self.transition(SyncState::Synced)?;
        self.last_sync_success = Some(now_ms);
        self.retry_count = 0;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, retry_count: u32) -> Result<()> {
        self.transition(SyncState::Failed)?;
        self.retry_count = retry_count.min(MAX_ATTEMPTS);
        self.error_message = Some(error.into());
        Ok(())
    }

    /// `failed -> pending` for a record whose retry budget is not spent
    pub fn mark_requeued(&mut self) -> Result<()> {
        if self.status == SyncState::Failed && self.retry_count >= MAX_ATTEMPTS {
            return Err(Error::InvalidInput(format!(
                "{} exhausted its retries and cannot be requeued automatically",
                self.key
            )));
        }
        self.transition(SyncState::Pending)
    }

    pub fn mark_conflict(&mut self, server_version: Value) -> Result<()> {
        self.transition(SyncState::Conflict)?;
        self.conflict_version = Some(server_version);
        Ok(())
    }

    /// Clear a terminal failure so the record can be retried by hand
    pub fn reset_retries(&mut self) -> Result<()> {
        self.retry_count = 0;
        self.transition(SyncState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status() -> RecordSyncStatus {
        RecordSyncStatus::pending(RecordKey::new("exercises", "ex-1"))
    }

    #[test]
    fn happy_path_reaches_synced() {
        let mut status = status();
        status.mark_syncing(10).unwrap();
        status.mark_synced(20).unwrap();
        assert_eq!(status.status, SyncState::Synced);
        assert_eq!(status.last_sync_attempt, Some(10));
        assert_eq!(status.last_sync_success, Some(20));
    }

    #[test]
    fn failed_then_requeued_clears_error() {
        let mut status = status();
        status.mark_syncing(10).unwrap();
        status.mark_failed("timeout", 1).unwrap();
        assert_eq!(status.error_message.as_deref(), Some("timeout"));

        status.mark_requeued().unwrap();
        assert_eq!(status.status, SyncState::Pending);
        assert!(status.error_message.is_none());
        assert_eq!(status.retry_count, 1);
    }

    #[test]
    fn exhausted_failure_is_terminal() {
        let mut status = status();
        status.mark_syncing(10).unwrap();
        status.mark_failed("server unavailable", MAX_ATTEMPTS).unwrap();
        assert!(status.mark_requeued().is_err());

        status.reset_retries().unwrap();
        assert_eq!(status.status, SyncState::Pending);
        assert_eq!(status.retry_count, 0);
    }

    #[test]
    fn conflict_version_only_present_in_conflict() {
        let mut status = status();
        status.mark_syncing(10).unwrap();
        status.mark_conflict(json!({"name": "server"})).unwrap();
        assert!(status.conflict_version.is_some());

        status.mark_synced(30).unwrap();
        assert!(status.conflict_version.is_none());
    }

    #[test]
    fn rejects_skipping_syncing() {
        let mut status = status();
        assert!(status.mark_synced(10).is_err());
        assert!(status.mark_failed("boom", 1).is_err());
        assert_eq!(status.status, SyncState::Pending);
    }

    #[test]
    fn retry_count_is_capped() {
        let mut status = status();
        status.mark_syncing(10).unwrap();
        status.mark_failed("boom", 42).unwrap();
        assert_eq!(status.retry_count, MAX_ATTEMPTS);
    }
}
