//! Infrastructure layer: the bulk-operation runner and its stores.

pub mod config;
pub mod ephemeral;
pub mod jobs;
pub mod rate_limit;
