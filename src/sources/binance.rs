//! Binance spot ticker REST source
//!
//! Prices `ORIGIN-TARGET` from the `ORIGINTARGET` symbol. The symbol catalogue
//! (`/api/v3/exchangeInfo`) is downloaded once per instance and only used by `supports`.

use async_trait::async_trait;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::cache::{Inflight, TtlCache};
use super::{http_client, parse_rate, RateSource, DEFAULT_CACHE_TTL, DEFAULT_TIMEOUT};
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

const BINANCE_API_URL: &str = "https://api.binance.com";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    status: Option<String>,
}

pub struct BinanceSource {
    name: String,
    client: reqwest::Client,
    base_url: String,
    catalogue: OnceCell<HashSet<PairId>>,
    cache: TtlCache<PairId, Decimal>,
    inflight: Inflight<PairId, Result<Decimal>>,
}

impl BinanceSource {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            name: "binance".to_string(),
            client: http_client(DEFAULT_TIMEOUT),
            base_url: base_url.trim_end_matches('/').to_string(),
            catalogue: OnceCell::new(),
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

    fn symbol(pair: &PairId) -> String {
        format!("{}{}", pair.origin(), pair.target())
    }

    async fn catalogue(&self) -> Result<&HashSet<PairId>> {
        self.catalogue
            .get_or_try_init(|| async {
                let url = format!("{}/api/v3/exchangeInfo", self.base_url);
                tracing::info!(source = %self.name, "Downloading symbol catalogue");

                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| RateError::Fetch(format!("Binance exchangeInfo failed: {}", e)))?;

                let info: ExchangeInfo = response.json().await.map_err(|e| {
                    RateError::Fetch(format!("Malformed Binance exchangeInfo: {}", e))
                })?;

                let pairs: HashSet<PairId> = info
                    .symbols
                    .into_iter()
                    .filter(|s| s.status.as_deref().map_or(true, |st| st == "TRADING"))
                    .map(|s| PairId::new(s.base_asset, s.quote_asset))
                    .collect();

                tracing::info!(source = %self.name, symbols = pairs.len(), "Symbol catalogue loaded");
                Ok::<_, RateError>(pairs)
            })
            .await
    }

    async fn ticker(&self, pair: &PairId) -> Result<Decimal> {
        if let Some(price) = self.cache.get(pair) {
            return Ok(price);
        }

        let client = self.client.clone();
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let symbol = Self::symbol(pair);
        let name = self.name.clone();
        let request_pair = pair.clone();
        let result = self
            .inflight
            .run(pair.clone(), move || {
                async move {
                    let response = client
                        .get(&url)
                        .query(&[("symbol", symbol.as_str())])
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| RateError::Fetch(format!("Binance ticker failed: {}", e)))?;

                    let ticker: TickerPrice = response.json().await.map_err(|e| {
                        RateError::Fetch(format!("Malformed Binance ticker: {}", e))
                    })?;

                    parse_rate(&ticker.price)
                        .ok_or_else(|| RateError::unavailable(name, &request_pair))
                }
                .boxed()
            })
            .await;

        if let Ok(price) = result {
            self.cache.insert(pair.clone(), price);
        }
        result
    }
}

impl Default for BinanceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateSource for BinanceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn supports(&self, pair: &PairId) -> Result<bool> {
        Ok(self.catalogue().await?.contains(pair))
    }

    async fn fetch(&self, pair: &PairId) -> Result<Observation> {
        match self.ticker(pair).await {
            Ok(price) => Ok(Observation::new(pair, price)),
            Err(e) => {
                tracing::debug!(source = %self.name, pair = %pair, error = %e, "Ticker unavailable");
                Err(RateError::unavailable(&self.name, pair))
            }
        }
    }
}
