//! Answers `A-B` from a wrapped source's `B-A` quote

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::RateSource;
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

pub struct InverseSource {
    name: String,
    inner: Arc<dyn RateSource>,
}

impl InverseSource {
    pub fn new(inner: Arc<dyn RateSource>) -> Self {
        Self {
            name: format!("inverse({})", inner.name()),
            inner,
        }
    }
}

#[async_trait]
impl RateSource for InverseSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn supports(&self, pair: &PairId) -> Result<bool> {
        self.inner.supports(&pair.inverse()).await
    }

    async fn fetch(&self, pair: &PairId) -> Result<Observation> {
        let quote = self.inner.fetch(&pair.inverse()).await.map_err(|e| {
            tracing::debug!(source = %self.name, pair = %pair, error = %e, "Inverse quote unavailable");
            RateError::unavailable(&self.name, pair)
        })?;

        let inverted = quote
            .value
            .filter(|v| !v.is_zero())
            .and_then(|v| Decimal::ONE.checked_div(v))
            .ok_or_else(|| RateError::unavailable(&self.name, pair))?;

        Ok(Observation {
            timestamp: quote.timestamp,
            ..Observation::new(pair, inverted)
        })
    }
}
