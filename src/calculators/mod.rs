//! Rate calculators - turn a batch of pairs into one result per pair for a tick
//!
//! - `SingleSourceCalculator`: every pair from one source
//! - `FailoverCalculator`: ordered fallback across other calculators
//! - `RobustCalculator`: median-based consensus across many sources

mod failover;
mod robust;
mod single;

pub use failover::FailoverCalculator;
pub use robust::{ConsensusSettings, DiagnosticReport, RejectReason, RobustCalculator};
pub use single::SingleSourceCalculator;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Observation, PairId};

/// Produces the current tick's results for a batch of pairs.
///
/// The returned vector has the same length and order as `pairs`. A slot is
/// `None` when the pair could not be reached at all, and `Some` with an empty
/// value when it was reached but had nothing usable this tick. Implementations
/// report per-pair trouble through the slots and do not fail the whole call.
#[async_trait]
pub trait RateCalculator: Send + Sync {
    fn name(&self) -> &str;

    async fn calculate_rates_for(&self, pairs: &[PairId]) -> Result<Vec<Option<Observation>>>;
}
