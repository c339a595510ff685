use std::sync::Arc;

use clap::Parser;
use pretty_assertions::assert_eq;
use reps_core::backend::MemoryBackend;
use reps_core::config::SyncConfig;
use reps_core::models::{Exercise, Priority, Resolution, SyncState};
use reps_core::SyncEngine;

use crate::cli::{Cli, CliPriority, Commands, KeepSide, SyncCommands};
use crate::commands::common::{
    format_exercise_line, format_relative_time, format_sync_timestamp,
    normalize_exercise_identifier, resolve_exercise, short_id,
};
use crate::commands::sync::{format_status_lines, run_sync_reset};
use crate::error::CliError;

fn engine() -> SyncEngine {
    SyncEngine::in_memory(SyncConfig::default(), Arc::new(MemoryBackend::new())).unwrap()
}

#[test]
fn parse_add_with_options() {
    let cli = Cli::try_parse_from([
        "reps", "add", "Back squat", "--sets", "5", "--reps", "5", "--weight", "100",
        "--priority", "high",
    ])
    .unwrap();

    match cli.command {
        Commands::Add {
            name,
            sets,
            reps,
            weight,
            priority,
            ..
        } => {
            assert_eq!(name, "Back squat");
            assert_eq!((sets, reps), (5, 5));
            assert_eq!(weight, Some(100.0));
            assert_eq!(priority, CliPriority::High);
        }
        _ => panic!("expected add command"),
    }
}

#[test]
fn parse_sync_resolve_requires_keep() {
    assert!(Cli::try_parse_from(["reps", "sync", "resolve", "c-1"]).is_err());

    let cli = Cli::try_parse_from(["reps", "sync", "resolve", "c-1", "--keep", "server"]).unwrap();
    match cli.command {
        Commands::Sync {
            command: Some(SyncCommands::Resolve { conflict_id, keep }),
        } => {
            assert_eq!(conflict_id, "c-1");
            assert_eq!(keep, KeepSide::Server);
        }
        _ => panic!("expected sync resolve command"),
    }
}

#[test]
fn parse_bare_sync_runs_a_pass() {
    let cli = Cli::try_parse_from(["reps", "sync"]).unwrap();
    assert!(matches!(cli.command, Commands::Sync { command: None }));
}

#[test]
fn keep_side_maps_to_resolution() {
    assert_eq!(Resolution::from(KeepSide::Local), Resolution::LocalWins);
    assert_eq!(Resolution::from(KeepSide::Server), Resolution::ServerWins);
    assert_eq!(Priority::from(CliPriority::Critical), Priority::Critical);
}

#[test]
fn normalize_exercise_identifier_rejects_blank() {
    assert_eq!(normalize_exercise_identifier("  abc ").unwrap(), "abc");
    assert!(matches!(
        normalize_exercise_identifier("   "),
        Err(CliError::EmptyExerciseId)
    ));
}

#[test]
fn resolve_exercise_by_prefix() {
    let engine = engine();
    let exercise = Exercise::new("Row", 4, 8).unwrap();
    engine.add_exercise(&exercise, Priority::Medium).unwrap();

    let id = exercise.id.as_str();
    let resolved = resolve_exercise(&id[..8], &engine).unwrap();
    assert_eq!(resolved.id, exercise.id);

    assert!(matches!(
        resolve_exercise("ffffffff-not-there", &engine),
        Err(CliError::ExerciseNotFound(_))
    ));
}

#[test]
fn resolve_exercise_reports_ambiguous_prefix() {
    let engine = engine();
    for name in ["Squat", "Bench"] {
        let exercise = Exercise::new(name, 3, 5).unwrap();
        engine.add_exercise(&exercise, Priority::Medium).unwrap();
    }
    // UUID v7 ids created together share their leading timestamp digits
    let first = engine.exercises().unwrap()[0].id.as_str();
    assert!(matches!(
        resolve_exercise(&first[..4], &engine),
        Err(CliError::AmbiguousExerciseId(_))
    ));
}

#[test]
fn relative_time_buckets() {
    let now = 10 * 365 * 24 * 60 * 60 * 1000_i64;
    assert_eq!(format_relative_time(now - 1_000, now), "just now");
    assert_eq!(format_relative_time(now - 5 * 60_000, now), "5m ago");
    assert_eq!(format_relative_time(now - 3 * 3_600_000, now), "3h ago");
    assert_eq!(format_relative_time(now - 2 * 86_400_000, now), "2d ago");
}

#[test]
fn sync_timestamp_is_utc() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn exercise_line_shows_state() {
    let exercise = Exercise::new("Bench", 3, 8).unwrap().with_weight(Some(80.0));
    let line = format_exercise_line(&exercise, Some(SyncState::Pending), exercise.updated_at);
    assert!(line.starts_with(&short_id(&exercise.id.as_str())));
    assert!(line.contains("Bench 3x8 @ 80kg"));
    assert!(line.contains("pending"));
    assert!(line.ends_with("just now"));

    let local = format_exercise_line(&exercise, None, exercise.updated_at);
    assert!(local.contains("local"));
}

#[test]
fn status_lines_cover_queue_and_network() {
    let engine = engine();
    let exercise = Exercise::new("Squat", 5, 5).unwrap();
    engine.add_exercise(&exercise, Priority::High).unwrap();

    let lines = format_status_lines(&engine.status().unwrap());
    assert_eq!(lines[1], "pending:    1");
    assert!(lines[0].starts_with("network:    online"));
    assert_eq!(lines[4], "last sync:  never");
}

#[test]
fn reset_requires_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_sync_reset(false, &dir.path().join("reps.db"));
    assert!(matches!(result, Err(CliError::ResetNotConfirmed)));
}
