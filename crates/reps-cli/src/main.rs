//! Reps CLI - log exercises offline and sync them when connected

mod cli;
mod commands;
mod config_profiles;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::add::run_add;
use crate::commands::common::resolve_db_path;
use crate::commands::config::run_config;
use crate::commands::delete::run_delete;
use crate::commands::list::run_list;
use crate::commands::sync::{
    run_sync, run_sync_conflicts, run_sync_failed, run_sync_reset, run_sync_resolve,
    run_sync_retry, run_sync_status,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["reps=info", "reps_core=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Add {
            name,
            sets,
            reps,
            weight,
            notes,
            priority,
        } => {
            run_add(&name, sets, reps, weight, notes, priority.into(), &db_path)?;
        }
        Commands::List { json } => run_list(json, &db_path)?,
        Commands::Delete { id, priority } => run_delete(&id, priority.into(), &db_path)?,
        Commands::Sync { command } => match command {
            None => run_sync(&db_path).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(json, &db_path)?,
            Some(SyncCommands::Conflicts { json }) => run_sync_conflicts(json, &db_path)?,
            Some(SyncCommands::Failed { json }) => run_sync_failed(json, &db_path)?,
            Some(SyncCommands::Retry { operation_id }) => {
                run_sync_retry(&operation_id, &db_path)?;
            }
            Some(SyncCommands::Resolve { conflict_id, keep }) => {
                run_sync_resolve(&conflict_id, keep, &db_path)?;
            }
            Some(SyncCommands::Reset { yes }) => run_sync_reset(yes, &db_path)?,
        },
        Commands::Config { command } => run_config(command)?,
    }

    Ok(())
}
