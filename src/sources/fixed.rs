//! Constant-rate source for pegged pairs (e.g. USDC-USD = 1)

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::RateSource;
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

#[derive(Debug, Clone)]
pub struct FixedRateSource {
    name: String,
    rates: HashMap<PairId, Decimal>,
}

impl FixedRateSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rates: HashMap::new(),
        }
    }

    pub fn with_rate(mut self, pair: PairId, rate: Decimal) -> Self {
        self.rates.insert(pair, rate);
        self
    }
}

#[async_trait]
impl RateSource for FixedRateSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn supports(&self, pair: &PairId) -> Result<bool> {
        Ok(self.rates.contains_key(pair))
    }

    async fn fetch(&self, pair: &PairId) -> Result<Observation> {
        self.rates
            .get(pair)
            .map(|rate| Observation::new(pair, *rate))
            .ok_or_else(|| RateError::unavailable(&self.name, pair))
    }
}
