//! Rate oracle error types

use thiserror::Error;

use crate::types::PairId;

/// Errors that can occur while sourcing or aggregating rates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    /// An origin has no usable value for a pair
    #[error("{source_name} has no rate for {pair}")]
    RateUnavailable { source_name: String, pair: PairId },

    /// A catalogue or transport call failed outside of a rate fetch
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A pair string could not be parsed
    #[error("Invalid pair: {0}")]
    InvalidPair(String),

    /// A calculator returned a batch that does not match the request
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// A calculator call failed as a whole
    #[error("Calculation failed: {0}")]
    Calculation(String),
}

impl RateError {
    pub fn unavailable(source_name: impl Into<String>, pair: &PairId) -> Self {
        RateError::RateUnavailable {
            source_name: source_name.into(),
            pair: pair.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RateError>;
