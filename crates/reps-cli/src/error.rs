use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] reps_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Exercise ID cannot be empty")]
    EmptyExerciseId,
    #[error("Exercise not found for id/prefix: {0}")]
    ExerciseNotFound(String),
    #[error("{0}")]
    AmbiguousExerciseId(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Run `reps config init --api-url <URL> --api-key <KEY>`, or set REPS_API_URL and REPS_API_KEY."
    )]
    SyncNotConfigured,
    #[error("Refusing to discard pending changes without --yes")]
    ResetNotConfirmed,
}
