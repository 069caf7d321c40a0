//! Infrastructure layer: job store, backends, credit ledger, runner and the
//! service facade tying them together.

pub mod config;
pub mod jobs;
pub mod service;

pub use config::EngineConfig;
pub use service::{GeocodingService, ServiceError, ServiceResult};

#[cfg(test)]
mod testing;
