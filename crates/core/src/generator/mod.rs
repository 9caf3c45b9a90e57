//! Job generators: one recurring task per task table.
//!
//! Each tick selects the oldest due generation of a pending job and runs exactly
//! one stage action:
//! - **INITIAL**: product type pre-check, then PRIMARY_CHECK
//! - **PRIMARY_CHECK**: input resolution, READY once nothing mandatory is missing
//! - **READY**: resolution again, publish, then SENT
//!
//! A failed action re-persists the current state so the job is retried after the
//! dwell time of that state.

mod job_generator;
mod pool;
mod types;

pub use job_generator::{GeneratorContext, JobGenerator};
pub use pool::GeneratorPool;
pub use types::{GeneratorError, GeneratorStatus, PoolStatus, TickOutcome};
