//! Composite source - one logical source backed by an ordered list of redundant origins

use async_trait::async_trait;
use std::sync::Arc;

use super::RateSource;
use crate::concurrency::first_success;
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

/// Tries each wrapped source in order and answers with the first usable result
pub struct CompositeSource {
    name: String,
    sources: Vec<Arc<dyn RateSource>>,
}

impl CompositeSource {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<dyn RateSource>>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }

    pub fn sources(&self) -> &[Arc<dyn RateSource>] {
        &self.sources
    }
}

#[async_trait]
impl RateSource for CompositeSource {
    fn name(&self) -> &str {
        &self.name
    }

    /// First wrapped source that answers either way wins; failing sources are skipped
    async fn supports(&self, pair: &PairId) -> Result<bool> {
        first_success(&self.sources, |source| async move {
            source.supports(pair).await.map(Some)
        })
        .await
        .ok_or_else(|| {
            RateError::Fetch(format!("no source in {} could answer for {}", self.name, pair))
        })
    }

    async fn fetch(&self, pair: &PairId) -> Result<Observation> {
        let found = first_success(&self.sources, |source| async move {
            let obs = source.fetch(pair).await?;
            Ok::<_, RateError>(obs.has_value().then_some(obs))
        })
        .await;

        found.ok_or_else(|| {
            tracing::debug!(source = %self.name, pair = %pair, "Every wrapped source failed");
            RateError::unavailable(&self.name, pair)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockRateSource;
    use rust_decimal_macros::dec;

    fn failing(name: &'static str) -> MockRateSource {
        let mut mock = MockRateSource::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_fetch()
            .times(1)
            .returning(move |pair| Err(RateError::unavailable(name, pair)));
        mock
    }

    fn answering(value: rust_decimal::Decimal) -> MockRateSource {
        let mut mock = MockRateSource::new();
        mock.expect_name().return_const("answering".to_string());
        mock.expect_fetch()
            .times(1)
            .returning(move |pair| Ok(Observation::new(pair, value)));
        mock
    }

    fn never_called() -> MockRateSource {
        let mut mock = MockRateSource::new();
        mock.expect_name().return_const("unreached".to_string());
        mock.expect_fetch().never();
        mock.expect_supports().never();
        mock
    }

    #[tokio::test]
    async fn test_fetch_stops_at_first_success() {
        let composite = CompositeSource::new(
            "redundant",
            vec![
                Arc::new(failing("a")),
                Arc::new(answering(dec!(50.0))),
                Arc::new(never_called()),
            ],
        );

        let pair = PairId::new("BTC", "USD");
        let obs = composite.fetch(&pair).await.unwrap();
        assert_eq!(obs.value, Some(dec!(50.0)));
    }

    #[tokio::test]
    async fn test_fetch_skips_observation_without_value() {
        let mut empty = MockRateSource::new();
        empty.expect_name().return_const("empty".to_string());
        empty
            .expect_fetch()
            .returning(|pair| Ok(Observation::empty(pair)));

        let composite = CompositeSource::new(
            "redundant",
            vec![Arc::new(empty), Arc::new(answering(dec!(7)))],
        );

        let obs = composite.fetch(&PairId::new("ETH", "USD")).await.unwrap();
        assert_eq!(obs.value, Some(dec!(7)));
    }

    #[tokio::test]
    async fn test_fetch_fails_naming_itself_when_exhausted() {
        let composite = CompositeSource::new(
            "redundant",
            vec![Arc::new(failing("a")), Arc::new(failing("b"))],
        );

        let pair = PairId::new("BTC", "USD");
        assert_eq!(
            composite.fetch(&pair).await.unwrap_err(),
            RateError::unavailable("redundant", &pair)
        );
    }

    #[tokio::test]
    async fn test_supports_first_definitive_answer_wins() {
        let mut broken = MockRateSource::new();
        broken.expect_name().return_const("broken".to_string());
        broken
            .expect_supports()
            .times(1)
            .returning(|_| Err(RateError::Fetch("catalogue down".into())));

        let mut says_no = MockRateSource::new();
        says_no.expect_name().return_const("no".to_string());
        says_no.expect_supports().times(1).returning(|_| Ok(false));

        let composite = CompositeSource::new(
            "redundant",
            vec![Arc::new(broken), Arc::new(says_no), Arc::new(never_called())],
        );

        assert!(!composite.supports(&PairId::new("BTC", "USD")).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_composite() {
        let composite = CompositeSource::new("empty", Vec::new());
        let pair = PairId::new("BTC", "USD");

        assert!(composite.supports(&pair).await.is_err());
        assert!(composite.fetch(&pair).await.is_err());
    }
}
