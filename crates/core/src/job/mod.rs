//! Job aggregate persisted in the catalog.

mod types;

pub use types::*;
