//! Job catalog: system of record for jobs and their generations.
//!
//! Two backends implement [`JobCatalog`]:
//! - [`HttpCatalogClient`] talks to a remote catalog service
//! - [`SqliteJobCatalog`] keeps jobs in a local database for single-node deployments

mod http;
mod sqlite;
mod store;

pub use http::{HttpCatalogClient, HttpCatalogConfig};
pub use sqlite::SqliteJobCatalog;
pub use store::*;
