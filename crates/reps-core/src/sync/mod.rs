//! Sync orchestration: processing passes, background driver and status

mod driver;
mod manager;
mod status;

pub use driver::SyncDriver;
pub use manager::{
    RemoteChange, RemoteChangeOutcome, RunDisposition, SyncErrorEntry, SyncManager, SyncParts,
    SyncPhase, SyncRunResult,
};
pub use status::{SyncStatus, SyncStatusReporter};
