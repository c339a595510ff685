use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reps_core::models::{ConflictId, ConnectionType, NetworkState, OperationId};
use reps_core::network::{ConnectivityProbe, ProbeError};
use reps_core::sync::SyncStatus;

use crate::cli::KeepSide;
use crate::commands::common::{
    format_conflict_lines, format_failed_lines, format_sync_timestamp, open_engine,
    open_sync_engine,
};
use crate::error::CliError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Treats any HTTP answer from the backend as connectivity
struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    fn new(url: &str) -> Result<Self, CliError> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|error| CliError::Config(format!("Failed to build HTTP client: {error}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Result<NetworkState, ProbeError> {
        match self.client.head(&self.url).send().await {
            Ok(_) => Ok(NetworkState::online(ConnectionType::Unknown)),
            Err(error) if error.is_connect() || error.is_timeout() => Ok(NetworkState::offline()),
            Err(error) => Err(ProbeError(error.to_string())),
        }
    }
}

pub async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let (engine, base_url) = open_sync_engine(db_path)?;
    let network = engine.network().refresh(&HttpProbe::new(&base_url)?).await;
    if !network.is_online {
        println!(
            "Offline; {} change(s) left queued",
            engine.queue().len()?
        );
        return Ok(());
    }

    let mut processed = 0;
    let mut conflicts = 0;
    let mut errors = Vec::new();
    let remaining = loop {
        let result = engine.process_now().await?;
        processed += result.processed;
        conflicts += result.conflicts;
        errors.extend(result.errors);
        // Stop once a pass makes no progress; what is left is waiting on backoff
        if result.processed == 0 || result.remaining == 0 {
            break result.remaining;
        }
    };

    println!("Synced {processed} change(s); {remaining} pending, {conflicts} conflict(s)");
    for error in &errors {
        let kind = if error.retryable { "will retry" } else { "failed" };
        eprintln!(
            "  {} {}/{} ({kind}): {}",
            error.operation.kind.as_str(),
            error.operation.target_table,
            error.operation.record_id,
            error.error
        );
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let last_sync = status
        .last_sync_at
        .map_or_else(|| "never".to_string(), format_sync_timestamp);
    vec![
        format!(
            "network:    {} ({:?})",
            if status.is_online { "online" } else { "offline" },
            status.network_quality
        ),
        format!("pending:    {}", status.pending_operations),
        format!("failed:     {}", status.failed_operations),
        format!("conflicts:  {}", status.unresolved_conflicts),
        format!("last sync:  {last_sync}"),
    ]
}

pub fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let status = engine.status()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn run_sync_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let conflicts = engine.conflicts()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No unresolved sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_sync_failed(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let failed = engine.failed()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&failed)?);
        return Ok(());
    }

    if failed.is_empty() {
        println!("No failed operations.");
        return Ok(());
    }

    for line in format_failed_lines(&failed) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_sync_retry(operation_id: &str, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let operation = engine.retry_failed(&OperationId::from(operation_id.trim()))?;
    println!(
        "Requeued {} {}/{}",
        operation.kind.as_str(),
        operation.target_table,
        operation.record_id
    );
    Ok(())
}

pub fn run_sync_resolve(conflict_id: &str, keep: KeepSide, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let conflict = engine.resolve_conflict(&ConflictId::from(conflict_id.trim()), keep.into(), None)?;
    println!(
        "Resolved {}/{} ({})",
        conflict.table_name,
        conflict.record_id,
        conflict.resolution.map_or("unresolved", |resolution| resolution.as_str())
    );
    Ok(())
}

pub fn run_sync_reset(confirmed: bool, db_path: &Path) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ResetNotConfirmed);
    }
    let engine = open_engine(db_path)?;
    let discarded = engine.reset_queue()?;
    println!("Discarded {discarded} pending operation(s)");
    Ok(())
}
