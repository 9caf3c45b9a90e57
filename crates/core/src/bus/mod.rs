//! Message bus client used for upstream events, job publishing and error reports.

mod http;
mod types;

pub use http::{HttpBusClient, HttpBusConfig};
pub use types::*;
