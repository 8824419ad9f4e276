//! CoinGecko simple-price REST source
//!
//! CoinGecko prices coins by id, not by ticker symbol. Symbols resolve through
//! configured overrides first, then through the coin list, which is downloaded
//! once and kept by this instance only.

use async_trait::async_trait;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::cache::{Inflight, TtlCache};
use super::{http_client, parse_rate, RateSource, DEFAULT_CACHE_TTL, DEFAULT_TIMEOUT};
use crate::error::{RateError, Result};
use crate::types::{Observation, PairId};

const COINGECKO_API_URL: &str = "https://api.coingecko.com";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Well-known symbols whose coin-list entry is ambiguous
const DEFAULT_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("USDT", "tether"),
    ("USDC", "usd-coin"),
    ("SOL", "solana"),
    ("XRP", "ripple"),
];

#[derive(Debug, Deserialize)]
struct CoinListEntry {
    id: String,
    symbol: String,
}

pub struct CoinGeckoSource {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    id_overrides: HashMap<String, String>,
    coin_ids: OnceCell<HashMap<String, String>>,
    vs_currencies: OnceCell<HashSet<String>>,
    cache: TtlCache<PairId, Decimal>,
    inflight: Inflight<PairId, Result<Decimal>>,
}

impl CoinGeckoSource {
    pub fn new() -> Self {
        Self::with_base_url(COINGECKO_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            name: "coingecko".to_string(),
            client: http_client(DEFAULT_TIMEOUT),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            id_overrides: DEFAULT_IDS
                .iter()
                .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
                .collect(),
            coin_ids: OnceCell::new(),
            vs_currencies: OnceCell::new(),
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

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Pin a symbol to a specific coin id
    pub fn with_coin_id(mut self, symbol: &str, id: impl Into<String>) -> Self {
        self.id_overrides.insert(symbol.to_uppercase(), id.into());
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .get(path)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RateError::Fetch(format!("CoinGecko {} failed: {}", path, e)))?;
        response
            .json()
            .await
            .map_err(|e| RateError::Fetch(format!("Malformed CoinGecko {}: {}", path, e)))
    }

    /// Symbol (upper-case) to coin id; the first listed coin wins a shared symbol
    async fn coin_ids(&self) -> Result<&HashMap<String, String>> {
        self.coin_ids
            .get_or_try_init(|| async {
                let coins: Vec<CoinListEntry> = self.get_json("/api/v3/coins/list").await?;
                let mut ids = HashMap::with_capacity(coins.len());
                for coin in coins {
                    ids.entry(coin.symbol.to_uppercase()).or_insert(coin.id);
                }
                tracing::info!(source = %self.name, coins = ids.len(), "Coin list loaded");
                Ok::<_, RateError>(ids)
            })
            .await
    }

    async fn vs_currencies(&self) -> Result<&HashSet<String>> {
        self.vs_currencies
            .get_or_try_init(|| async {
                let currencies: Vec<String> = self
                    .get_json("/api/v3/simple/supported_vs_currencies")
                    .await?;
                Ok::<_, RateError>(currencies.into_iter().map(|c| c.to_uppercase()).collect())
            })
            .await
    }

    async fn coin_id(&self, symbol: &str) -> Result<Option<String>> {
        if let Some(id) = self.id_overrides.get(symbol) {
            return Ok(Some(id.clone()));
        }
        Ok(self.coin_ids().await?.get(symbol).cloned())
    }

    async fn simple_price(&self, pair: &PairId) -> Result<Decimal> {
        if let Some(price) = self.cache.get(pair) {
            return Ok(price);
        }

        let id = self
            .coin_id(pair.origin())
            .await?
            .ok_or_else(|| RateError::unavailable(&self.name, pair))?;

        let vs = pair.target().to_lowercase();
        let request = self
            .get("/api/v3/simple/price")
            .query(&[("ids", id.as_str()), ("vs_currencies", vs.as_str())]);
        let name = self.name.clone();
        let request_pair = pair.clone();
        let result = self
            .inflight
            .run(pair.clone(), move || {
                async move {
                    let response = request
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| RateError::Fetch(format!("CoinGecko price failed: {}", e)))?;

                    let body: serde_json::Value = response.json().await.map_err(|e| {
                        RateError::Fetch(format!("Malformed CoinGecko price: {}", e))
                    })?;

                    body.get(&id)
                        .and_then(|quotes| quotes.get(&vs))
                        .and_then(parse_rate)
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

impl Default for CoinGeckoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateSource for CoinGeckoSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn supports(&self, pair: &PairId) -> Result<bool> {
        if self.coin_id(pair.origin()).await?.is_none() {
            return Ok(false);
        }
        Ok(self.vs_currencies().await?.contains(pair.target()))
    }

    async fn fetch(&self, pair: &PairId) -> Result<Observation> {
        match self.simple_price(pair).await {
            Ok(price) => Ok(Observation::new(pair, price)),
            Err(e) => {
                tracing::debug!(source = %self.name, pair = %pair, error = %e, "Simple price unavailable");
                Err(RateError::unavailable(&self.name, pair))
            }
        }
    }
}
