pub mod add;
pub mod common;
pub mod config;
pub mod delete;
pub mod list;
pub mod sync;
