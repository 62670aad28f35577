//! Infrastructure layer: job queue stores, worker runtime, config, clock.

pub mod clock;
pub mod config;
pub mod jobs;
pub mod workers;
