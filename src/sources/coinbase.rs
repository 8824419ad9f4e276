//! Coinbase exchange-rates REST source
//!
//! One `GET /v2/exchange-rates?currency=ORIGIN` call returns every target for an
//! origin, so responses are cached and de-duplicated per origin.

use async_trait::async_trait;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::cache::{Inflight, TtlCache};
use super::{http_client, parse_rate, RateSource, DEFAULT_CACHE_TTL, DEFAULT_TIMEOUT};
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

const COINBASE_API_URL: &str = "https://api.coinbase.com";

/// Every target rate quoted for one origin currency
type RateSheet = Arc<HashMap<String, Decimal>>;

#[derive(Debug, Deserialize)]
struct ExchangeRatesResponse {
    data: ExchangeRatesData,
}

#[derive(Debug, Deserialize)]
struct ExchangeRatesData {
    #[serde(default)]
    rates: HashMap<String, serde_json::Value>,
}

pub struct CoinbaseSource {
    name: String,
    client: reqwest::Client,
    base_url: String,
    cache: TtlCache<String, RateSheet>,
    inflight: Inflight<String, Result<RateSheet>>,
}

impl CoinbaseSource {
    pub fn new() -> Self {
        Self::with_base_url(COINBASE_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            name: "coinbase".to_string(),
            client: http_client(DEFAULT_TIMEOUT),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: TtlCache::new(DEFAULT_CACHE_TTL),
            inflight: Inflight::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = TtlCache::new(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Rate sheet for `origin`, from cache, from a pending request, or freshly downloaded
    async fn rate_sheet(&self, origin: &str) -> Result<RateSheet> {
        let key = origin.to_string();
        if let Some(sheet) = self.cache.get(&key) {
            return Ok(sheet);
        }

        let client = self.client.clone();
        let url = format!("{}/v2/exchange-rates", self.base_url);
        let currency = key.clone();
        let result = self
            .inflight
            .run(key.clone(), move || {
                async move { download_sheet(client, url, currency).await }.boxed()
            })
            .await;

        if let Ok(sheet) = &result {
            self.cache.insert(key, sheet.clone());
        }
        result
    }
}

impl Default for CoinbaseSource {
    fn default() -> Self {
        Self::new()
    }
}

async fn download_sheet(client: reqwest::Client, url: String, currency: String) -> Result<RateSheet> {
    tracing::debug!(source = "coinbase", currency = %currency, "Downloading exchange rates");

    let response = client
        .get(&url)
        .query(&[("currency", currency.as_str())])
        .send()
        .await
        .map_err(|e| RateError::Fetch(format!("Coinbase request failed: {}", e)))?;

    let status = response.status();
    if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::NOT_FOUND {
        // Coinbase answers 400 for currencies it does not know
        return Ok(Arc::new(HashMap::new()));
    }
    if !status.is_success() {
        return Err(RateError::Fetch(format!(
            "Coinbase returned {} for {}",
            status, currency
        )));
    }

    let body: ExchangeRatesResponse = response
        .json()
        .await
        .map_err(|e| RateError::Fetch(format!("Malformed Coinbase response: {}", e)))?;

    let sheet: HashMap<String, Decimal> = body
        .data
        .rates
        .iter()
        .filter_map(|(target, raw)| parse_rate(raw).map(|rate| (target.to_uppercase(), rate)))
        .collect();

    Ok(Arc::new(sheet))
}

#[async_trait]
impl RateSource for CoinbaseSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn supports(&self, pair: &PairId) -> Result<bool> {
        let sheet = self.rate_sheet(pair.origin()).await?;
        Ok(sheet.contains_key(pair.target()))
    }

    async fn fetch(&self, pair: &PairId) -> Result<Observation> {
        let sheet = self.rate_sheet(pair.origin()).await.map_err(|e| {
            tracing::debug!(source = %self.name, pair = %pair, error = %e, "Rate sheet unavailable");
            RateError::unavailable(&self.name, pair)
        })?;

        sheet
            .get(pair.target())
            .map(|rate| Observation::new(pair, *rate))
            .ok_or_else(|| RateError::unavailable(&self.name, pair))
    }
}
