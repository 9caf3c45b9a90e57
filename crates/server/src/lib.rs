//! Process wiring and operator HTTP surface of the job generator.

pub mod api;
pub mod metrics;
pub mod services;
pub mod state;
