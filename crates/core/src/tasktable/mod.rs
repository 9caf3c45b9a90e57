//! Declarative processor definitions ("task tables").
//!
//! A task table lists the pools of tasks a processor runs, each task's inputs
//! (with their alternatives) and outputs. Tables are validated once at startup
//! through [`TaskTableAdapter`].

mod adapter;
mod loader;
mod types;

pub use adapter::{AdaptedInput, TaskTableAdapter};
pub use loader::{load_task_tables, parse_task_table, task_table_name};
pub use types::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskTableError {
    #[error("failed to read task tables: {0}")]
    Io(String),

    #[error("failed to parse task table {table}: {reason}")]
    Parse { table: String, reason: String },

    #[error("invalid task table {table}: {reason}")]
    Invalid { table: String, reason: String },
}
