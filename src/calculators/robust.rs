//! Robust consensus calculator
//!
//! Every configured source is queried for every pair. A source counts towards
//! the result only when both its price and its move since its own previous
//! price sit close to the cross-source medians:
//!
//! - `|price - median_price| < price_threshold * median_price`
//! - `|delta - median_delta| < change_threshold * median_price`
//!
//! The price test drops a persistently wrong source, the delta test drops one
//! in the middle of a flash crash even while its price still looks plausible.
//! The emitted rate is the mean price of the sources that pass both tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::RateCalculator;
use crate::concurrency::join_all;
use crate::error::{RateError, Result};
use crate::sources::RateSource;
use crate::types::{Observation, PairId};

/// Consensus thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusSettings {
    /// Allowed price distance from the median, as a fraction of the median price
    pub price_threshold: Decimal,
    /// Allowed delta distance from the median delta, as a fraction of the median price
    pub change_threshold: Decimal,
    /// Minimum number of sources that must be valid, and then reliable
    pub min_sources: usize,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            price_threshold: Decimal::new(5, 2),  // 5%
            change_threshold: Decimal::new(2, 2), // 2%
            min_sources: 2,
        }
    }
}

/// Why a source did not contribute to a pair's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    NoCurrentPrice,
    PriceDeviation,
    PriceChangeDeviation,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoCurrentPrice => write!(f, "NO_CURRENT_PRICE"),
            RejectReason::PriceDeviation => write!(f, "PRICE_DEVIATION"),
            RejectReason::PriceChangeDeviation => write!(f, "PRICE_CHANGE_DEVIATION"),
        }
    }
}

/// Last tick's per-source data for one pair. Index `i` in every vector is source `i`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticReport {
    pub sources: Vec<String>,
    pub prices: Vec<Option<Decimal>>,
    pub deltas: Vec<Option<Decimal>>,
    pub valid: Vec<bool>,
    pub reject_reasons: Vec<Option<RejectReason>>,
    pub errors: Vec<Option<String>>,
    pub median_price: Option<Decimal>,
    pub median_delta: Option<Decimal>,
    pub result: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DiagnosticReport {
    pub fn reliable_count(&self) -> usize {
        self.valid
            .iter()
            .zip(&self.reject_reasons)
            .filter(|(valid, reason)| **valid && reason.is_none())
            .count()
    }
}

struct SourceSet {
    sources: Vec<Arc<dyn RateSource>>,
    /// Bumped on every replacement so results of a tick that straddles one are dropped
    generation: u64,
}

pub struct RobustCalculator {
    name: String,
    settings: ConsensusSettings,
    source_set: RwLock<SourceSet>,
    /// Previous price per pair, indexed like the source list
    last_prices: RwLock<HashMap<PairId, Vec<Option<Decimal>>>>,
    reports: RwLock<HashMap<PairId, DiagnosticReport>>,
}

impl RobustCalculator {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<Arc<dyn RateSource>>,
        settings: ConsensusSettings,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            source_set: RwLock::new(SourceSet {
                sources,
                generation: 0,
            }),
            last_prices: RwLock::new(HashMap::new()),
            reports: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> ConsensusSettings {
        self.settings
    }

    /// Replace the source list. Clears the diagnostic reports and the price memory.
    pub fn set_sources(&self, sources: Vec<Arc<dyn RateSource>>) {
        if let Ok(mut set) = self.source_set.write() {
            set.sources = sources;
            set.generation += 1;
        }
        if let Ok(mut last) = self.last_prices.write() {
            last.clear();
        }
        if let Ok(mut reports) = self.reports.write() {
            reports.clear();
        }
        tracing::info!(calculator = %self.name, "Source list replaced, diagnostics reset");
    }

    pub fn source_names(&self) -> Vec<String> {
        self.source_set
            .read()
            .map(|set| set.sources.iter().map(|s| s.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Diagnostic report for one pair
    pub fn report(&self, pair: &PairId) -> Option<DiagnosticReport> {
        self.reports.read().ok()?.get(pair).cloned()
    }

    pub fn reports(&self) -> HashMap<PairId, DiagnosticReport> {
        self.reports
            .read()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    fn snapshot_sources(&self) -> (Vec<Arc<dyn RateSource>>, u64) {
        self.source_set
            .read()
            .map(|set| (set.sources.clone(), set.generation))
            .unwrap_or_default()
    }

    fn current_generation(&self) -> Option<u64> {
        self.source_set.read().ok().map(|set| set.generation)
    }

    async fn calculate_pair(
        &self,
        pair: &PairId,
        sources: &[Arc<dyn RateSource>],
        generation: u64,
    ) -> Option<Observation> {
        let fetched = join_all(sources, |source| async move { source.fetch(pair).await }).await;

        let previous = self
            .last_prices
            .read()
            .ok()
            .and_then(|last| last.get(pair).cloned())
            .filter(|prices| prices.len() == sources.len())
            .unwrap_or_else(|| vec![None; sources.len()]);

        let mut report = DiagnosticReport {
            sources: sources.iter().map(|s| s.name().to_string()).collect(),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        let mut current = previous.clone();

        for (i, outcome) in fetched.into_iter().enumerate() {
            match outcome {
                Ok(Observation {
                    value: Some(price), ..
                }) => {
                    let delta = previous[i].map(|p| price - p).unwrap_or(Decimal::ZERO);
                    current[i] = Some(price);
                    report.prices.push(Some(price));
                    report.deltas.push(Some(delta));
                    report.valid.push(true);
                    report.reject_reasons.push(None);
                    report.errors.push(None);
                }
                other => {
                    let error = match other {
                        Err(e) => e.to_string(),
                        Ok(_) => "no value".to_string(),
                    };
                    tracing::debug!(
                        calculator = %self.name,
                        pair = %pair,
                        source = %report.sources[i],
                        error = %error,
                        "Source has no current price"
                    );
                    report.prices.push(None);
                    report.deltas.push(None);
                    report.valid.push(false);
                    report.reject_reasons.push(Some(RejectReason::NoCurrentPrice));
                    report.errors.push(Some(error));
                }
            }
        }

        let result = self.consensus(&mut report);

        if self.current_generation() == Some(generation) {
            if let Ok(mut last) = self.last_prices.write() {
                last.insert(pair.clone(), current);
            }
            if let Ok(mut reports) = self.reports.write() {
                reports.insert(pair.clone(), report);
            }
        }

        result.map(|value| Observation::new(pair, value))
    }

    /// Fill in the medians and reject reasons, and return the mean price of the
    /// reliable sources if there are enough of them
    fn consensus(&self, report: &mut DiagnosticReport) -> Option<Decimal> {
        let valid: Vec<usize> = (0..report.valid.len()).filter(|&i| report.valid[i]).collect();
        if valid.is_empty() || valid.len() < self.settings.min_sources {
            tracing::debug!(
                calculator = %self.name,
                valid = valid.len(),
                required = self.settings.min_sources,
                "Not enough valid sources"
            );
            return None;
        }

        let prices: Vec<Decimal> = valid.iter().filter_map(|&i| report.prices[i]).collect();
        let deltas: Vec<Decimal> = valid.iter().filter_map(|&i| report.deltas[i]).collect();
        let (Some(median_price), Some(median_delta)) = (median(&prices), median(&deltas)) else {
            tracing::debug!(calculator = %self.name, "Median out of decimal range");
            return None;
        };
        report.median_price = Some(median_price);
        report.median_delta = Some(median_delta);

        let bands = self
            .settings
            .price_threshold
            .checked_mul(median_price)
            .zip(self.settings.change_threshold.checked_mul(median_price));
        let Some((price_band, change_band)) = bands else {
            tracing::debug!(calculator = %self.name, median = %median_price, "Threshold band out of decimal range");
            return None;
        };

        let mut reliable = Vec::with_capacity(valid.len());
        for &i in &valid {
            let (Some(price), Some(delta)) = (report.prices[i], report.deltas[i]) else {
                continue;
            };
            if price
                .checked_sub(median_price)
                .map_or(true, |distance| distance.abs() >= price_band)
            {
                report.reject_reasons[i] = Some(RejectReason::PriceDeviation);
            } else if delta
                .checked_sub(median_delta)
                .map_or(true, |distance| distance.abs() >= change_band)
            {
                report.reject_reasons[i] = Some(RejectReason::PriceChangeDeviation);
            } else {
                reliable.push(price);
            }
        }

        if reliable.is_empty() || reliable.len() < self.settings.min_sources {
            tracing::debug!(
                calculator = %self.name,
                reliable = reliable.len(),
                required = self.settings.min_sources,
                "Not enough reliable sources"
            );
            return None;
        }

        let mean = reliable
            .iter()
            .try_fold(Decimal::ZERO, |sum, price| sum.checked_add(*price))
            .and_then(|sum| sum.checked_div(Decimal::from(reliable.len())));
        let Some(mean) = mean else {
            tracing::debug!(calculator = %self.name, reliable = reliable.len(), "Mean out of decimal range");
            return None;
        };
        report.result = Some(mean);
        Some(mean)
    }
}

#[async_trait]
impl RateCalculator for RobustCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn calculate_rates_for(&self, pairs: &[PairId]) -> Result<Vec<Option<Observation>>> {
        let (sources, generation) = self.snapshot_sources();
        let sources = &sources;

        let results = join_all(pairs, |pair| async move {
            Ok::<_, RateError>(self.calculate_pair(pair, sources, generation).await)
        })
        .await;

        Ok(results
            .into_iter()
            .zip(pairs)
            .map(|(result, pair)| {
                let obs = result.ok().flatten();
                if obs.is_none() {
                    tracing::warn!(calculator = %self.name, pair = %pair, "No consensus this tick");
                }
                obs
            })
            .collect())
    }
}

fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        sorted[mid - 1]
            .checked_add(sorted[mid])
            .and_then(|sum| sum.checked_div(Decimal::TWO))
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::FixedRateSource;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Source whose price can be moved between ticks
    struct ScriptedSource {
        name: String,
        price: Mutex<Option<Decimal>>,
    }

    impl ScriptedSource {
        fn new(name: &str, price: Decimal) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                price: Mutex::new(Some(price)),
            })
        }

        fn set(&self, price: Option<Decimal>) {
            *self.price.lock().unwrap() = price;
        }
    }

    #[async_trait]
    impl RateSource for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn supports(&self, _pair: &PairId) -> Result<bool> {
            Ok(true)
        }

        async fn fetch(&self, pair: &PairId) -> Result<Observation> {
            let price = *self.price.lock().unwrap();
            price
                .map(|p| Observation::new(pair, p))
                .ok_or_else(|| RateError::unavailable(&self.name, pair))
        }
    }

    /// Source that holds every fetch until the gate opens
    struct GatedSource {
        price: Decimal,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl RateSource for GatedSource {
        fn name(&self) -> &str {
            "gated"
        }

        async fn supports(&self, _pair: &PairId) -> Result<bool> {
            Ok(true)
        }

        async fn fetch(&self, pair: &PairId) -> Result<Observation> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(Observation::new(pair, self.price))
        }
    }

    fn fixed_sources(pair: &PairId, prices: &[Decimal]) -> Vec<Arc<dyn RateSource>> {
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| {
                Arc::new(FixedRateSource::new(format!("s{}", i)).with_rate(pair.clone(), *price))
                    as Arc<dyn RateSource>
            })
            .collect()
    }

    fn settings(min_sources: usize) -> ConsensusSettings {
        ConsensusSettings {
            price_threshold: dec!(0.05),
            change_threshold: dec!(0.02),
            min_sources,
        }
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[dec!(3), dec!(1), dec!(2)]), Some(dec!(2)));
        assert_eq!(median(&[dec!(4), dec!(1), dec!(2), dec!(3)]), Some(dec!(2.5)));
    }

    #[tokio::test]
    async fn test_outlier_excluded_from_mean() {
        let pair = PairId::new("BTC", "USD");
        let sources = fixed_sources(
            &pair,
            &[dec!(100), dec!(101), dec!(99), dec!(102), dec!(1000)],
        );
        let calculator = RobustCalculator::new("robust", sources, settings(3));

        let results = calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();

        assert_eq!(results[0].as_ref().unwrap().value, Some(dec!(100.5)));

        let report = calculator.report(&pair).unwrap();
        assert_eq!(report.median_price, Some(dec!(101)));
        assert_eq!(report.reject_reasons[4], Some(RejectReason::PriceDeviation));
        assert!(report.valid.iter().all(|v| *v));
        assert_eq!(report.reliable_count(), 4);
    }

    #[tokio::test]
    async fn test_insufficient_agreement_is_unreachable() {
        let pair = PairId::new("BTC", "USD");
        let sources = fixed_sources(&pair, &[dec!(100), dec!(200), dec!(300)]);
        let calculator = RobustCalculator::new("robust", sources, settings(3));

        let results = calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();

        assert!(results[0].is_none());
        let report = calculator.report(&pair).unwrap();
        assert_eq!(report.median_price, Some(dec!(200)));
        assert_eq!(report.reliable_count(), 1);
    }

    #[tokio::test]
    async fn test_too_few_valid_sources_still_reports() {
        let pair = PairId::new("ETH", "USD");
        let dead = ScriptedSource::new("dead", dec!(1));
        dead.set(None);
        let sources: Vec<Arc<dyn RateSource>> = vec![
            dead,
            Arc::new(FixedRateSource::new("live").with_rate(pair.clone(), dec!(3000))),
        ];
        let calculator = RobustCalculator::new("robust", sources, settings(2));

        let results = calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();

        assert!(results[0].is_none());
        let report = calculator.report(&pair).unwrap();
        assert_eq!(report.valid, vec![false, true]);
        assert_eq!(report.reject_reasons[0], Some(RejectReason::NoCurrentPrice));
        assert!(report.errors[0].is_some());
        assert_eq!(report.prices[1], Some(dec!(3000)));
        assert_eq!(report.median_price, None);
    }

    #[tokio::test]
    async fn test_flash_crash_rejected_by_delta() {
        let pair = PairId::new("BTC", "USD");
        let a = ScriptedSource::new("a", dec!(100));
        let b = ScriptedSource::new("b", dec!(100));
        let c = ScriptedSource::new("c", dec!(100));
        let sources: Vec<Arc<dyn RateSource>> = vec![a.clone(), b.clone(), c.clone()];
        let calculator = RobustCalculator::new("robust", sources, settings(2));
        let batch = std::slice::from_ref(&pair);

        let first = calculator.calculate_rates_for(batch).await.unwrap();
        assert_eq!(first[0].as_ref().unwrap().value, Some(dec!(100)));

        // c drops 4%: inside the 5% price band, outside the 2% change band
        c.set(Some(dec!(96)));
        let second = calculator.calculate_rates_for(batch).await.unwrap();
        assert_eq!(second[0].as_ref().unwrap().value, Some(dec!(100)));

        let report = calculator.report(&pair).unwrap();
        assert_eq!(report.deltas[2], Some(dec!(-4)));
        assert_eq!(
            report.reject_reasons[2],
            Some(RejectReason::PriceChangeDeviation)
        );
        assert_eq!(report.reject_reasons[0], None);
    }

    #[tokio::test]
    async fn test_set_sources_resets_diagnostics() {
        let pair = PairId::new("BTC", "USD");
        let calculator = RobustCalculator::new(
            "robust",
            fixed_sources(&pair, &[dec!(100), dec!(100)]),
            settings(2),
        );
        calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();
        assert!(calculator.report(&pair).is_some());

        calculator.set_sources(fixed_sources(&pair, &[dec!(200), dec!(202), dec!(201)]));
        assert!(calculator.report(&pair).is_none());
        assert_eq!(calculator.source_names(), vec!["s0", "s1", "s2"]);

        let results = calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();
        assert_eq!(results[0].as_ref().unwrap().value, Some(dec!(201)));
        assert_eq!(calculator.report(&pair).unwrap().deltas, vec![Some(dec!(0)); 3]);
    }

    #[tokio::test]
    async fn test_prices_near_decimal_max_are_absent_not_fatal() {
        let pair = PairId::new("BTC", "USD");
        let huge = dec!(50000000000000000000000000000);
        let calculator = RobustCalculator::new("robust", fixed_sources(&pair, &[huge, huge]), settings(2));

        // Median of two overflows
        let results = calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();
        assert!(results[0].is_none());
        assert_eq!(calculator.report(&pair).unwrap().median_price, None);

        // Median fits, the sum for the mean does not
        let large = dec!(30000000000000000000000000000);
        calculator.set_sources(fixed_sources(&pair, &[large, large, large]));
        let results = calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();
        assert!(results[0].is_none());
        let report = calculator.report(&pair).unwrap();
        assert_eq!(report.median_price, Some(large));
        assert_eq!(report.result, None);
    }

    #[tokio::test]
    async fn test_tick_straddling_set_sources_leaves_no_trace() {
        let pair = PairId::new("BTC", "USD");
        let gated = Arc::new(GatedSource {
            price: dec!(100),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let sources: Vec<Arc<dyn RateSource>> = vec![
            gated.clone(),
            Arc::new(FixedRateSource::new("fixed").with_rate(pair.clone(), dec!(100))),
        ];
        let calculator = Arc::new(RobustCalculator::new("robust", sources, settings(2)));

        let in_flight = tokio::spawn({
            let calculator = calculator.clone();
            let pair = pair.clone();
            async move {
                calculator
                    .calculate_rates_for(std::slice::from_ref(&pair))
                    .await
            }
        });

        gated.entered.notified().await;
        calculator.set_sources(fixed_sources(&pair, &[dec!(200), dec!(200)]));
        gated.gate.notify_one();
        in_flight.await.unwrap().unwrap();

        assert!(calculator.report(&pair).is_none());
        assert!(calculator.reports().is_empty());

        // No remembered prices from the old list, so no deltas against 100
        calculator
            .calculate_rates_for(std::slice::from_ref(&pair))
            .await
            .unwrap();
        let report = calculator.report(&pair).unwrap();
        assert_eq!(report.deltas, vec![Some(dec!(0)); 2]);
        assert_eq!(report.result, Some(dec!(200)));
    }
}
