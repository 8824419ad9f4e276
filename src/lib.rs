//! Rate Oracle Library
//!
//! Aggregates currency rates from many independent sources, tolerating
//! partial failure through ordered failover or median-based consensus.

pub mod calculators;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod service;
pub mod sources;
pub mod types;

pub use calculators::RateCalculator;
pub use error::{RateError, Result};
pub use service::{RateService, ServiceStatus};
pub use sources::RateSource;
pub use types::{Observation, PairId, RateTable, RateUpdate};
