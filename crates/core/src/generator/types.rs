use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::job::GenerationState;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("no generator for task table {0}")]
    UnknownTaskTable(String),
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No generation was due.
    Idle,
    Advanced {
        job_id: i64,
        from: GenerationState,
        to: GenerationState,
    },
    /// The stage action failed; the state was persisted again.
    RolledBack {
        job_id: i64,
        state: GenerationState,
        reason: String,
    },
    /// Another writer updated the generation first.
    Conflict { job_id: i64 },
}

impl TickOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::Idle => "idle",
            TickOutcome::Advanced { .. } => "advanced",
            TickOutcome::RolledBack { .. } => "rolled_back",
            TickOutcome::Conflict { .. } => "conflict",
        }
    }
}

/// Counters of one generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratorStatus {
    pub task_table: String,
    pub ticks: u64,
    pub advanced: u64,
    pub rolled_back: u64,
    pub conflicts: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<DateTime<Utc>>,
}

impl GeneratorStatus {
    pub fn new(task_table: impl Into<String>) -> Self {
        Self {
            task_table: task_table.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, result: &Result<TickOutcome, GeneratorError>, at: DateTime<Utc>) {
        self.ticks += 1;
        self.last_tick = Some(at);
        match result {
            Ok(TickOutcome::Idle) => {}
            Ok(TickOutcome::Advanced { .. }) => self.advanced += 1,
            Ok(TickOutcome::RolledBack { reason, .. }) => {
                self.rolled_back += 1;
                self.last_error = Some(reason.clone());
            }
            Ok(TickOutcome::Conflict { .. }) => self.conflicts += 1,
            Err(e) => {
                self.errors += 1;
                self.last_error = Some(e.to_string());
            }
        }
    }
}

/// Current status of the generator pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    pub running: bool,
    pub generators: Vec<GeneratorStatus>,
}
