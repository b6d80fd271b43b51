#![forbid(unsafe_code)]

//! Sync subsystem of the podcast directory: pulls playlist items from the
//! YouTube Data API into stored episodes under a daily quota, records errors,
//! aggregates daily analytics and runs all of it on a schedule.

pub mod analytics;
pub mod config;
pub mod error;
pub mod notify;
pub mod quota;
pub mod reconcile;
pub mod records;
pub mod rehost;
pub mod scheduler;
pub mod security;
pub mod settings;
pub mod store;
pub mod sync;
pub mod youtube;
