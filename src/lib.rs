//! Background refresh worker for warehouse task dashboards.
//!
//! Periodically pulls task events from the warehouse system, derives
//! per-task timing metrics, merges them into the retained history and
//! publishes an immutable [`snapshot::Snapshot`] that any number of readers
//! can hold without blocking the refresh loop.

pub mod config;
pub mod export;
pub mod load;
pub mod snapshot;
pub mod task;
pub mod upstream;
pub mod worker;
