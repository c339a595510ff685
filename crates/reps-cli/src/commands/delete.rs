use std::path::Path;

use reps_core::models::Priority;

use crate::commands::common::{open_engine, resolve_exercise};
use crate::error::CliError;

pub fn run_delete(id: &str, priority: Priority, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let exercise = resolve_exercise(id, &engine)?;

    engine.delete_exercise(&exercise.id, priority)?;
    println!("{}", exercise.id);
    Ok(())
}
