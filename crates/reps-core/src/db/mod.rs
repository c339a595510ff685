//! Database layer for Reps

mod connection;
mod migrations;
mod replica_repository;
mod sync_store;

pub use connection::Database;
pub use replica_repository::SqliteReplica;
pub use sync_store::SqliteSyncStore;
