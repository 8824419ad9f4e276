//! Configuration management for the rate oracle
//!
//! Loads from optional config files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::calculators::RateCalculator;
use crate::types::PairId;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub calculator: CalculatorConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Seconds between scheduled ticks
    pub refresh_interval_secs: u64,
    /// Pairs to track, as "ORIGIN-TARGET"
    pub pairs: Vec<String>,
    /// Buffered updates per subscriber
    pub notify_capacity: usize,
}

impl ServiceConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn pair_ids(&self) -> Result<Vec<PairId>> {
        self.pairs
            .iter()
            .map(|p| PairId::from_str(p).with_context(|| format!("service.pairs entry '{}'", p)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (RATE_ORACLE__*)
            .add_source(
                Environment::with_prefix("RATE_ORACLE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("service.pairs")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        Self::from_config(config)
    }

    /// Parse a YAML document on top of the defaults
    pub fn from_yaml(document: &str) -> Result<Self> {
        let config = Self::defaults()?
            .add_source(File::from_str(document, FileFormat::Yaml))
            .build()
            .context("Failed to build configuration")?;

        Self::from_config(config)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("service.refresh_interval_secs", 60)?
            .set_default("service.pairs", vec!["BTC-USD", "ETH-USD"])?
            .set_default("service.notify_capacity", 64)?
            .set_default("log.json", false)?)
    }

    fn from_config(config: Config) -> Result<Self> {
        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    pub fn build_pipeline(&self) -> Result<Pipeline> {
        self.calculator.build().context("Invalid calculator configuration")
    }

    pub fn build_calculator(&self) -> Result<Arc<dyn RateCalculator>> {
        Ok(self.build_pipeline()?.calculator)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        let calculator = match &self.calculator {
            CalculatorConfig::Single { .. } => "single".to_string(),
            CalculatorConfig::Failover { name, calculators } => {
                format!("failover({}, {} calculators)", name, calculators.len())
            }
            CalculatorConfig::Robust {
                name,
                sources,
                min_sources,
                ..
            } => format!("robust({}, {} sources, min {})", name, sources.len(), min_sources),
        };
        format!(
            "pairs={:?} refresh={}s calculator={} json_logs={}",
            self.service.pairs, self.service.refresh_interval_secs, calculator, self.log.json
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
