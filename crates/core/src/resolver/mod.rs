//! Input resolution engine.
//!
//! For one job and task table, finds files for every declared input:
//! - searchable alternatives are grouped by deduplication key and queried once,
//!   non-empty results are memoized on the job
//! - alternatives are tried by ascending order, the first with files wins
//! - references copy their target, forward references are resolved in a second pass
//! - optional inputs are dropped once their waiting time elapsed

mod engine;
mod query;
mod timeout;

pub use engine::InputResolver;
pub use query::{ece_polarisation, file_from_metadata, query_for, search_params, Families};
pub use timeout::InputTimeoutChecker;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    /// A reference whose target is not applicable to the product mode.
    #[error("input {input} references {target} which does not apply to this product")]
    DanglingReference { input: String, target: String },

    #[error("invalid waiting rule pattern '{pattern}': {reason}")]
    InvalidWaitingRule { pattern: String, reason: String },
}

/// Outcome of one resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every applicable input has a result or was dropped.
    Complete,
    /// Inputs still waited for, by reference name.
    ///
    /// A reference whose target is applicable but has no result yet is listed here
    /// and retried on the next tick. Only a target the product mode excludes fails.
    Incomplete { missing: Vec<String> },
    Failed { cause: ResolveError },
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        matches!(self, Resolution::Complete)
    }
}
