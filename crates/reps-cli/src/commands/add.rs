use std::path::Path;

use reps_core::models::{Exercise, Priority};

use crate::commands::common::open_engine;
use crate::error::CliError;

pub fn run_add(
    name: &str,
    sets: u32,
    reps: u32,
    weight_kg: Option<f64>,
    notes: Option<String>,
    priority: Priority,
    db_path: &Path,
) -> Result<(), CliError> {
    let exercise = Exercise::new(name, sets, reps)?
        .with_weight(weight_kg)
        .with_notes(notes);
    exercise.validate()?;

    let engine = open_engine(db_path)?;
    engine.add_exercise(&exercise, priority)?;

    println!("{}", exercise.id);
    Ok(())
}
