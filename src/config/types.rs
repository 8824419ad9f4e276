//! Declarative source and calculator trees

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::calculators::{
    ConsensusSettings, FailoverCalculator, RateCalculator, RobustCalculator,
    SingleSourceCalculator,
};
use crate::sources::{
    BinanceSource, CoinGeckoSource, CoinbaseSource, CompositeSource, FixedRateSource,
    InverseSource, RateSource,
};
use crate::types::PairId;

/// Shared settings of the HTTP-backed sources
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpSourceConfig {
    pub name: Option<String>,
    /// Override the public API endpoint
    pub base_url: Option<String>,
    /// Response cache window in seconds (0 disables caching)
    pub cache_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinGeckoConfig {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub cache_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub api_key: Option<String>,
    /// Extra symbol to coin id mappings, e.g. `ADA: cardano`
    #[serde(default)]
    pub coin_ids: HashMap<String, String>,
}

/// One node of the source tree
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Coinbase(HttpSourceConfig),
    Binance(HttpSourceConfig),
    Coingecko(CoinGeckoConfig),
    /// Constant rate for a set of pairs
    Fixed {
        name: String,
        rate: String,
        pairs: Vec<String>,
    },
    /// Answers A-B from the wrapped source's B-A
    Inverse { source: Box<SourceConfig> },
    /// Ordered failover across several sources
    Composite {
        name: String,
        sources: Vec<SourceConfig>,
    },
}

/// One node of the calculator tree
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalculatorConfig {
    Single {
        source: SourceConfig,
    },
    Failover {
        #[serde(default = "default_failover_name")]
        name: String,
        calculators: Vec<CalculatorConfig>,
    },
    Robust {
        #[serde(default = "default_robust_name")]
        name: String,
        sources: Vec<SourceConfig>,
        #[serde(default = "default_price_threshold")]
        price_threshold: Decimal,
        #[serde(default = "default_change_threshold")]
        change_threshold: Decimal,
        #[serde(default = "default_min_sources")]
        min_sources: usize,
    },
}

fn default_failover_name() -> String {
    "failover".to_string()
}

fn default_robust_name() -> String {
    "robust".to_string()
}

fn default_price_threshold() -> Decimal {
    Decimal::new(5, 2)
}

fn default_change_threshold() -> Decimal {
    Decimal::new(2, 2)
}

fn default_min_sources() -> usize {
    2
}

impl Default for CalculatorConfig {
    /// Coinbase first, CoinGecko as fallback
    fn default() -> Self {
        CalculatorConfig::Failover {
            name: default_failover_name(),
            calculators: vec![
                CalculatorConfig::Single {
                    source: SourceConfig::Coinbase(HttpSourceConfig::default()),
                },
                CalculatorConfig::Single {
                    source: SourceConfig::Coingecko(CoinGeckoConfig::default()),
                },
            ],
        }
    }
}

/// A built calculator plus every source it reads from directly
pub struct Pipeline {
    pub calculator: Arc<dyn RateCalculator>,
    pub sources: Vec<Arc<dyn RateSource>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("calculator", &self.calculator.name())
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CalculatorConfig {
    pub fn build(&self) -> Result<Pipeline> {
        let mut sources = Vec::new();
        let calculator = self.build_into(&mut sources)?;
        Ok(Pipeline {
            calculator,
            sources,
        })
    }

    fn build_into(&self, sources: &mut Vec<Arc<dyn RateSource>>) -> Result<Arc<dyn RateCalculator>> {
        match self {
            CalculatorConfig::Single { source } => {
                let source = source.build()?;
                sources.push(source.clone());
                Ok(Arc::new(SingleSourceCalculator::new(source)))
            }
            CalculatorConfig::Failover { name, calculators } => {
                if calculators.is_empty() {
                    bail!("Failover calculator '{}' has no calculators", name);
                }
                let calculators = calculators
                    .iter()
                    .map(|c| c.build_into(sources))
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Invalid calculator in failover '{}'", name))?;
                Ok(Arc::new(FailoverCalculator::new(name.clone(), calculators)))
            }
            CalculatorConfig::Robust {
                name,
                sources: source_configs,
                price_threshold,
                change_threshold,
                min_sources,
            } => {
                if *min_sources == 0 {
                    bail!("Robust calculator '{}' needs min_sources >= 1", name);
                }
                if source_configs.is_empty() {
                    bail!("Robust calculator '{}' has no sources", name);
                }
                for (field, value) in [("price_threshold", price_threshold), ("change_threshold", change_threshold)] {
                    if value.is_sign_negative() {
                        bail!("Robust calculator '{}' {} must not be negative, got {}", name, field, value);
                    }
                }
                let settings = ConsensusSettings {
                    price_threshold: *price_threshold,
                    change_threshold: *change_threshold,
                    min_sources: *min_sources,
                };
                let built = source_configs
                    .iter()
                    .map(SourceConfig::build)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Invalid source in robust '{}'", name))?;
                sources.extend(built.iter().cloned());
                Ok(Arc::new(RobustCalculator::new(name.clone(), built, settings)))
            }
        }
    }
}

impl SourceConfig {
    pub fn build(&self) -> Result<Arc<dyn RateSource>> {
        let source: Arc<dyn RateSource> = match self {
            SourceConfig::Coinbase(http) => {
                let mut source = match &http.base_url {
                    Some(url) => CoinbaseSource::with_base_url(url),
                    None => CoinbaseSource::new(),
                };
                if let Some(name) = &http.name {
                    source = source.with_name(name.clone());
                }
                if let Some(secs) = http.cache_secs {
                    source = source.with_cache_ttl(Duration::from_secs(secs));
                }
                if let Some(secs) = http.timeout_secs {
                    source = source.with_timeout(Duration::from_secs(secs));
                }
                Arc::new(source)
            }
            SourceConfig::Binance(http) => {
                let mut source = match &http.base_url {
                    Some(url) => BinanceSource::with_base_url(url),
                    None => BinanceSource::new(),
                };
                if let Some(name) = &http.name {
                    source = source.with_name(name.clone());
                }
                if let Some(secs) = http.cache_secs {
                    source = source.with_cache_ttl(Duration::from_secs(secs));
                }
                if let Some(secs) = http.timeout_secs {
                    source = source.with_timeout(Duration::from_secs(secs));
                }
                Arc::new(source)
            }
            SourceConfig::Coingecko(cfg) => {
                let mut source = match &cfg.base_url {
                    Some(url) => CoinGeckoSource::with_base_url(url),
                    None => CoinGeckoSource::new(),
                };
                if let Some(name) = &cfg.name {
                    source = source.with_name(name.clone());
                }
                if let Some(secs) = cfg.cache_secs {
                    source = source.with_cache_ttl(Duration::from_secs(secs));
                }
                if let Some(secs) = cfg.timeout_secs {
                    source = source.with_timeout(Duration::from_secs(secs));
                }
                if let Some(key) = &cfg.api_key {
                    source = source.with_api_key(key.clone());
                }
                for (symbol, id) in &cfg.coin_ids {
                    source = source.with_coin_id(symbol, id.clone());
                }
                Arc::new(source)
            }
            SourceConfig::Fixed { name, rate, pairs } => {
                let rate = Decimal::from_str(rate.trim())
                    .with_context(|| format!("Fixed source '{}' has a non-decimal rate '{}'", name, rate))?;
                let mut source = FixedRateSource::new(name.clone());
                for pair in pairs {
                    let pair = PairId::from_str(pair)
                        .with_context(|| format!("Fixed source '{}'", name))?;
                    source = source.with_rate(pair, rate);
                }
                Arc::new(source)
            }
            SourceConfig::Inverse { source } => Arc::new(InverseSource::new(source.build()?)),
            SourceConfig::Composite { name, sources } => {
                if sources.is_empty() {
                    bail!("Composite source '{}' has no sources", name);
                }
                let sources = sources
                    .iter()
                    .map(SourceConfig::build)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Invalid source in composite '{}'", name))?;
                Arc::new(CompositeSource::new(name.clone(), sources))
            }
        };
        Ok(source)
    }
}
