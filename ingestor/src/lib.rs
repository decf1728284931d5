//! Forwards environmental-sensor readings from the device cloud into a
//! time-series store, either live (latest reading per device on a fixed
//! period) or as a paginated backfill of a device's history.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod dedup;
pub mod errors;
pub mod history;
pub mod metrics;
pub mod model;
pub mod poller;
pub mod scheduler;
pub mod transform;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
