use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::RateCalculator;
use crate::concurrency::{first_success, join_all};
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

/// Resolves each pair with the first wrapped calculator that has a value for it.
///
/// A pair nobody can price yields an empty observation rather than an
/// unreachable slot, so an unsupported pair never flags the service.
pub struct FailoverCalculator {
    name: String,
    calculators: Vec<Arc<dyn RateCalculator>>,
    /// Calculator that last answered, per pair
    last_used: RwLock<HashMap<PairId, String>>,
}

impl FailoverCalculator {
    pub fn new(name: impl Into<String>, calculators: Vec<Arc<dyn RateCalculator>>) -> Self {
        Self {
            name: name.into(),
            calculators,
            last_used: RwLock::new(HashMap::new()),
        }
    }

    /// Name of the calculator that last produced a value for `pair`
    pub fn last_used(&self, pair: &PairId) -> Option<String> {
        self.last_used.read().ok()?.get(pair).cloned()
    }

    async fn resolve(&self, pair: &PairId) -> Option<(String, Observation)> {
        first_success(&self.calculators, |calculator| async move {
            let results = calculator
                .calculate_rates_for(std::slice::from_ref(pair))
                .await?;
            let found = results
                .into_iter()
                .next()
                .flatten()
                .filter(|obs| obs.has_value() && obs.matches(pair))
                .map(|obs| (calculator.name().to_string(), obs));
            Ok::<_, RateError>(found)
        })
        .await
    }
}

#[async_trait]
impl RateCalculator for FailoverCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn calculate_rates_for(&self, pairs: &[PairId]) -> Result<Vec<Option<Observation>>> {
        let resolved = join_all(pairs, |pair| async move {
            Ok::<_, RateError>(self.resolve(pair).await)
        })
        .await;

        let mut results = Vec::with_capacity(pairs.len());
        for (outcome, pair) in resolved.into_iter().zip(pairs) {
            match outcome.ok().flatten() {
                Some((used, obs)) => {
                    if let Ok(mut last_used) = self.last_used.write() {
                        last_used.insert(pair.clone(), used);
                    }
                    results.push(Some(obs));
                }
                None => {
                    tracing::warn!(calculator = %self.name, pair = %pair, "No calculator could price pair");
                    results.push(Some(Observation::empty(pair)));
                }
            }
        }
        Ok(results)
    }
}
