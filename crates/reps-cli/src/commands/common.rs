use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reps_core::backend::{ApplyOutcome, BackendError, RestBackend, StorageBackend};
use reps_core::models::{
    Conflict, Exercise, FailedOperation, Operation, RecordKey, SyncState,
    EXERCISES_TABLE,
};
use reps_core::network::NetworkMonitor;
use reps_core::SyncEngine;
use serde::Serialize;

use crate::config_profiles::CliConfig;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct ExerciseListItem {
    pub id: String,
    pub name: String,
    pub sets: u32,
    pub reps: u32,
    pub weight_kg: Option<f64>,
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub sync_state: Option<SyncState>,
}

/// Backend used for local-only commands; nothing is ever sent through it
#[derive(Debug)]
struct UnconfiguredBackend;

#[async_trait]
impl StorageBackend for UnconfiguredBackend {
    async fn apply(&self, _operation: &Operation) -> ApplyOutcome {
        ApplyOutcome::Failed(BackendError::Network(
            "sync backend is not configured".to_string(),
        ))
    }
}

#[derive(Clone, Copy)]
enum OpenEngineMode {
    Local,
    RequireSync,
}

impl OpenEngineMode {
    const fn requires_sync(self) -> bool {
        matches!(self, Self::RequireSync)
    }
}

/// Engine for commands that only touch local state
pub fn open_engine(db_path: &Path) -> Result<SyncEngine, CliError> {
    open_engine_with_mode(db_path, OpenEngineMode::Local).map(|(engine, _)| engine)
}

/// Engine wired to the configured REST backend, plus that backend's base URL
pub fn open_sync_engine(db_path: &Path) -> Result<(SyncEngine, String), CliError> {
    let (engine, base_url) = open_engine_with_mode(db_path, OpenEngineMode::RequireSync)?;
    let base_url = base_url.ok_or(CliError::SyncNotConfigured)?;
    Ok((engine, base_url))
}

fn open_engine_with_mode(
    db_path: &Path,
    mode: OpenEngineMode,
) -> Result<(SyncEngine, Option<String>), CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let config = CliConfig::load().map_err(CliError::Config)?;
    let backend_config = config.backend_config().map_err(CliError::Config)?;

    let (backend, base_url): (Arc<dyn StorageBackend>, Option<String>) =
        match (backend_config, mode.requires_sync()) {
            (Some(backend_config), true) => {
                let base_url = backend_config.base_url.clone();
                let backend = RestBackend::new(backend_config, config.sync.apply_timeout())?;
                tracing::debug!(%base_url, "Using REST sync backend");
                (Arc::new(backend), Some(base_url))
            }
            (None, true) => return Err(CliError::SyncNotConfigured),
            (_, false) => (Arc::new(UnconfiguredBackend), None),
        };

    let network = Arc::new(NetworkMonitor::new());
    Ok((
        SyncEngine::open_sqlite(db_path, config.sync, backend, network)?,
        base_url,
    ))
}

pub fn normalize_exercise_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyExerciseId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Find an exercise by full ID or unique prefix
pub fn resolve_exercise(query: &str, engine: &SyncEngine) -> Result<Exercise, CliError> {
    let query = normalize_exercise_identifier(query)?;
    let matches = engine
        .exercises()?
        .into_iter()
        .filter(|exercise| exercise.id.as_str().starts_with(&query))
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [] => Err(CliError::ExerciseNotFound(query)),
        [exercise] => Ok(exercise.clone()),
        many => {
            if let Some(exact) = many.iter().find(|exercise| exercise.id.as_str() == query) {
                return Ok(exact.clone());
            }
            let options = many
                .iter()
                .take(3)
                .map(|exercise| short_id(&exercise.id.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousExerciseId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn exercise_sync_state(engine: &SyncEngine, exercise: &Exercise) -> Option<SyncState> {
    engine
        .manager()
        .record_status(&RecordKey::new(EXERCISES_TABLE, exercise.id.as_str()))
        .ok()
        .flatten()
        .map(|status| status.status)
}

pub fn exercise_to_list_item(exercise: &Exercise, sync_state: Option<SyncState>) -> ExerciseListItem {
    let now_ms = Utc::now().timestamp_millis();
    ExerciseListItem {
        id: exercise.id.to_string(),
        name: exercise.name.clone(),
        sets: exercise.sets,
        reps: exercise.reps,
        weight_kg: exercise.weight_kg,
        notes: exercise.notes.clone(),
        created_at: exercise.created_at,
        updated_at: exercise.updated_at,
        relative_time: format_relative_time(exercise.updated_at, now_ms),
        sync_state,
    }
}

pub fn format_exercise_line(exercise: &Exercise, sync_state: Option<SyncState>, now_ms: i64) -> String {
    let short_id = short_id(&exercise.id.as_str());
    let summary = exercise.summary();
    let relative_time = format_relative_time(exercise.updated_at, now_ms);
    let state = sync_state.map_or("local", SyncState::as_str);
    format!("{short_id:<13}  {summary:<36}  {state:<8}  {relative_time}")
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}  {:<17}  {}/{}",
                format_sync_timestamp(conflict.detected_at),
                conflict.id,
                conflict.conflict_type.as_str(),
                conflict.table_name,
                conflict.record_id
            )
        })
        .collect()
}

pub fn format_failed_lines(failed: &[FailedOperation]) -> Vec<String> {
    failed
        .iter()
        .map(|record| {
            let operation = &record.operation;
            format!(
                "{}  {}  {:<6}  {}/{}  attempts={}  {}: {}",
                format_sync_timestamp(record.failed_at),
                operation.id,
                operation.kind.as_str(),
                operation.target_table,
                operation.record_id,
                operation.attempts,
                record.reason.as_str(),
                record.error
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("REPS_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reps")
        .join("reps.db")
}
