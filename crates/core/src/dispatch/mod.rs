//! Upstream event handling.
//!
//! - [`EventConsumer`]: poll loop over one bus category, filters and acknowledges
//! - [`JobDispatcher`]: creates jobs or appends messages to existing ones
//! - [`ErrorReportHandle`]: forwards handler failures to the bus error category

mod consumer;
mod dispatcher;
mod error_repo;

pub use consumer::{ConsumeOutcome, EventConsumer, EventHandler, MessageFilter};
pub use dispatcher::{DispatchOutcome, DispatcherSettings, JobDispatcher};
pub use error_repo::{create_error_repository, ErrorReport, ErrorReportHandle, ErrorReportWriter};

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::product::PrimaryCheckError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid catalog event: {0}")]
    InvalidEvent(String),

    #[error("no task table routed for product type {0}")]
    NoRoute(String),

    #[error("no generator for task table {0}")]
    UnknownTaskTable(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{0}")]
    Product(#[from] PrimaryCheckError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}
