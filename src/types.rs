//! Core types used throughout the rate oracle
//!
//! Defines pair identifiers, observations and the snapshots published by the service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RateError;

/// A tracked quantity: the (origin, target) pair of currency codes.
///
/// Codes are stored upper-cased. The canonical string form is `ORIGIN-TARGET`
/// and is used both for display and as the serialized map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairId {
    origin: String,
    target: String,
}

impl PairId {
    pub fn new(origin: impl AsRef<str>, target: impl AsRef<str>) -> Self {
        Self {
            origin: origin.as_ref().trim().to_uppercase(),
            target: target.as_ref().trim().to_uppercase(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The same pair quoted the other way round (`USD-BTC` for `BTC-USD`)
    pub fn inverse(&self) -> Self {
        Self {
            origin: self.target.clone(),
            target: self.origin.clone(),
        }
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.target)
    }
}

impl FromStr for PairId {
    type Err = RateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((origin, target))
                if !origin.trim().is_empty()
                    && !target.trim().is_empty()
                    && !target.contains('-') =>
            {
                Ok(PairId::new(origin, target))
            }
            _ => Err(RateError::InvalidPair(s.to_string())),
        }
    }
}

impl TryFrom<String> for PairId {
    type Error = RateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PairId> for String {
    fn from(pair: PairId) -> Self {
        pair.to_string()
    }
}

/// A timestamped rate for one pair.
///
/// `value` and `change` are `None` when no usable rate was available, which is
/// different from a zero rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub origin: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub value: Option<Decimal>,
    /// Percentage change versus the previously stored value for this pair
    pub change: Option<Decimal>,
}

impl Observation {
    /// Fresh observation carrying `value`, with no change computed yet
    pub fn new(pair: &PairId, value: Decimal) -> Self {
        Self {
            origin: pair.origin().to_string(),
            target: pair.target().to_string(),
            timestamp: Utc::now(),
            value: Some(value),
            change: None,
        }
    }

    /// Placeholder observation with neither value nor change
    pub fn empty(pair: &PairId) -> Self {
        Self {
            origin: pair.origin().to_string(),
            target: pair.target().to_string(),
            timestamp: Utc::now(),
            value: None,
            change: None,
        }
    }

    pub fn pair(&self) -> PairId {
        PairId::new(&self.origin, &self.target)
    }

    pub fn matches(&self, pair: &PairId) -> bool {
        self.origin.eq_ignore_ascii_case(pair.origin())
            && self.target.eq_ignore_ascii_case(pair.target())
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// Percentage change from `previous` to `current`.
///
/// `None` when `previous` is zero or the result does not fit in a `Decimal`.
pub fn percent_change(previous: Decimal, current: Decimal) -> Option<Decimal> {
    current
        .checked_sub(previous)?
        .checked_div(previous)?
        .checked_mul(Decimal::ONE_HUNDRED)
}

/// Latest observation per tracked pair
pub type RateTable = HashMap<PairId, Observation>;

/// Notification published after every tick
#[derive(Debug, Clone, Serialize)]
pub struct RateUpdate {
    /// Full snapshot of the result table at publication time
    pub rates: RateTable,
    /// Service error flag at publication time
    pub error: bool,
    pub published_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_parse_and_display() {
        let pair: PairId = "btc-usd".parse().unwrap();
        assert_eq!(pair.origin(), "BTC");
        assert_eq!(pair.target(), "USD");
        assert_eq!(pair.to_string(), "BTC-USD");
        assert_eq!(pair.inverse().to_string(), "USD-BTC");
    }

    #[test]
    fn test_pair_parse_rejects_malformed() {
        assert!("BTCUSD".parse::<PairId>().is_err());
        assert!("-USD".parse::<PairId>().is_err());
        assert!("BTC-".parse::<PairId>().is_err());
        assert!("A-B-C".parse::<PairId>().is_err());
    }

    #[test]
    fn test_pair_serializes_as_canonical_string() {
        let mut table = HashMap::new();
        table.insert(PairId::new("eth", "eur"), 1);
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, r#"{"ETH-EUR":1}"#);
    }

    #[test]
    fn test_observation_matches_pair() {
        let pair = PairId::new("BTC", "USD");
        let obs = Observation::new(&pair, dec!(50000));
        assert!(obs.matches(&pair));
        assert!(!obs.matches(&pair.inverse()));
        assert_eq!(obs.pair(), pair);
        assert!(!Observation::empty(&pair).has_value());
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(dec!(100), dec!(105)), Some(dec!(5)));
        assert_eq!(percent_change(dec!(200), dec!(150)), Some(dec!(-25)));
        assert_eq!(percent_change(dec!(0), dec!(1)), None);
    }

    #[test]
    fn test_percent_change_overflow_is_none() {
        assert_eq!(percent_change(dec!(0.0000000001), dec!(1000000000000000000)), None);
        assert_eq!(percent_change(dec!(1), Decimal::MAX), None);
    }
}
