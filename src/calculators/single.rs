use async_trait::async_trait;
use std::sync::Arc;

use super::RateCalculator;
use crate::concurrency::join_all;
use crate::error::Result;
use crate::sources::RateSource;
use crate::types::{Observation, PairId};

/// Asks one source for every pair in parallel
pub struct SingleSourceCalculator {
    name: String,
    source: Arc<dyn RateSource>,
}

impl SingleSourceCalculator {
    pub fn new(source: Arc<dyn RateSource>) -> Self {
        Self {
            name: format!("single({})", source.name()),
            source,
        }
    }
}

#[async_trait]
impl RateCalculator for SingleSourceCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn calculate_rates_for(&self, pairs: &[PairId]) -> Result<Vec<Option<Observation>>> {
        let source = &self.source;
        let results = join_all(pairs, |pair| async move { source.fetch(pair).await }).await;

        Ok(results
            .into_iter()
            .zip(pairs)
            .map(|(result, pair)| match result {
                Ok(obs) => Some(obs),
                Err(e) => {
                    tracing::debug!(calculator = %self.name, pair = %pair, error = %e, "Source failed");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::FixedRateSource;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_failure_only_empties_its_own_slot() {
        let btc = PairId::new("BTC", "USD");
        let eth = PairId::new("ETH", "USD");
        let doge = PairId::new("DOGE", "USD");
        let source = FixedRateSource::new("fixed")
            .with_rate(btc.clone(), dec!(50000))
            .with_rate(eth.clone(), dec!(3000));
        let calculator = SingleSourceCalculator::new(Arc::new(source));

        let results = calculator
            .calculate_rates_for(&[btc.clone(), doge, eth.clone()])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().value, Some(dec!(50000)));
        assert!(results[1].is_none());
        assert!(results[2].as_ref().unwrap().matches(&eth));
        assert_eq!(calculator.name(), "single(fixed)");
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let calculator = SingleSourceCalculator::new(Arc::new(FixedRateSource::new("fixed")));
        assert!(calculator.calculate_rates_for(&[]).await.unwrap().is_empty());
    }
}
