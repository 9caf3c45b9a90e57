//! Metadata search service client.

mod http;
mod types;

pub use http::{HttpMetadataClient, MetadataConfig};
pub use types::*;
