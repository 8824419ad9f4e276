//! Rate source implementations (Coinbase, Binance, CoinGecko, fixed, inverse, composite)

pub mod cache;
mod binance;
mod coinbase;
mod coingecko;
mod composite;
mod fixed;
mod inverse;

pub use binance::BinanceSource;
pub use coinbase::CoinbaseSource;
pub use coingecko::CoinGeckoSource;
pub use composite::CompositeSource;
pub use fixed::FixedRateSource;
pub use inverse::InverseSource;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Observation, PairId};

/// Default validity window for cached upstream responses
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default HTTP request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single origin able to price pairs.
///
/// `supports` is never consulted implicitly by `fetch`; callers that care ask first.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Name used in errors, logs and diagnostics
    fn name(&self) -> &str;

    /// Whether this origin knows the pair. May need a one-time catalogue call.
    async fn supports(&self, pair: &PairId) -> Result<bool>;

    /// Current rate for the pair, or `RateError::RateUnavailable`
    async fn fetch(&self, pair: &PairId) -> Result<Observation>;
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Parse an upstream rate given either as a JSON string or number.
///
/// Rejects anything that is not a finite, strictly positive decimal.
pub(crate) fn parse_rate(raw: &serde_json::Value) -> Option<Decimal> {
    let text = match raw {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => {
            if !n.as_f64().map(f64::is_finite).unwrap_or(false) {
                return None;
            }
            n.to_string()
        }
        _ => return None,
    };

    let value = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()?;

    if value > Decimal::ZERO {
        Some(value.normalize())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_rate_accepts_strings_and_numbers() {
        assert_eq!(parse_rate(&json!("50000.12")), Some(dec!(50000.12)));
        assert_eq!(parse_rate(&json!(3012.5)), Some(dec!(3012.5)));
        assert_eq!(parse_rate(&json!(42)), Some(dec!(42)));
        assert_eq!(parse_rate(&json!("1.5e-5")), Some(dec!(0.000015)));
    }

    #[test]
    fn test_parse_rate_rejects_unusable_values() {
        assert_eq!(parse_rate(&json!("abc")), None);
        assert_eq!(parse_rate(&json!("0")), None);
        assert_eq!(parse_rate(&json!(-1.0)), None);
        assert_eq!(parse_rate(&json!(null)), None);
        assert_eq!(parse_rate(&json!("NaN")), None);
    }
}
