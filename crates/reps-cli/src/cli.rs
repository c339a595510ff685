use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use reps_core::models::{Priority, Resolution};

#[derive(Parser)]
#[command(name = "reps")]
#[command(about = "Log exercises offline and sync them when connected")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log an exercise
    #[command(alias = "new")]
    Add {
        /// Exercise name, e.g. "Back squat"
        name: String,
        #[arg(long, default_value = "3")]
        sets: u32,
        #[arg(long, default_value = "10")]
        reps: u32,
        /// Working weight in kilograms
        #[arg(long, value_name = "KG")]
        weight: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
        /// Sync priority of the change
        #[arg(long, value_enum, default_value_t = CliPriority::Medium)]
        priority: CliPriority,
    },
    /// List logged exercises, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an exercise
    Delete {
        /// Exercise ID or unique ID prefix
        id: String,
        #[arg(long, value_enum, default_value_t = CliPriority::Medium)]
        priority: CliPriority,
    },
    /// Push pending changes to the backend (one drain)
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Configure the sync backend
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl From<CliPriority> for Priority {
    fn from(value: CliPriority) -> Self {
        match value {
            CliPriority::Critical => Self::Critical,
            CliPriority::High => Self::High,
            CliPriority::Medium => Self::Medium,
            CliPriority::Low => Self::Low,
        }
    }
}

/// Side to keep when settling a conflict by hand
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Server,
}

impl From<KeepSide> for Resolution {
    fn from(value: KeepSide) -> Self {
        match value {
            KeepSide::Local => Self::LocalWins,
            KeepSide::Server => Self::ServerWins,
        }
    }
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show queue, network and last-sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List conflicts awaiting a decision
    Conflicts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List operations that exhausted their retries or were rejected
    Failed {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a failed operation back into the queue
    Retry {
        operation_id: String,
    },
    /// Settle a conflict
    Resolve {
        conflict_id: String,
        /// Version to keep
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
    /// Discard every pending operation
    Reset {
        /// Confirm that unsynced changes will be lost
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update the backend config
    Init {
        /// Backend base URL, e.g. <https://project.supabase.co>
        #[arg(long, value_name = "URL")]
        api_url: String,
        /// Backend API key
        #[arg(long, value_name = "KEY")]
        api_key: String,
    },
    /// Print the current config with the API key masked
    Show,
}
