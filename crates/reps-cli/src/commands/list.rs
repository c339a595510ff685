use std::path::Path;

use chrono::Utc;

use crate::commands::common::{
    exercise_sync_state, exercise_to_list_item, format_exercise_line, open_engine,
    ExerciseListItem,
};
use crate::error::CliError;

pub fn run_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path)?;
    let exercises = engine.exercises()?;

    if as_json {
        let json_items = exercises
            .iter()
            .map(|exercise| exercise_to_list_item(exercise, exercise_sync_state(&engine, exercise)))
            .collect::<Vec<ExerciseListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else {
        let now_ms = Utc::now().timestamp_millis();
        for exercise in &exercises {
            println!(
                "{}",
                format_exercise_line(exercise, exercise_sync_state(&engine, exercise), now_ms)
            );
        }
    }

    Ok(())
}
