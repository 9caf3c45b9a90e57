//! Execution job assembly and publishing.

mod publisher;
mod types;

pub use publisher::Publisher;
pub use types::*;
