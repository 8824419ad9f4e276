//! Rate Service - owns the tracked pairs and the last-known-good rate table
//!
//! Drives a `RateCalculator` on a fixed schedule, merges each tick into the
//! table, keeps a sticky error flag and broadcasts a full snapshot after every
//! tick. Overlapping ticks are not serialized: when a tick outlives the refresh
//! interval the next one starts anyway and the last merge wins.

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use crate::calculators::RateCalculator;
use crate::concurrency::sequence;
use crate::error::{RateError, Result};
use crate::types::{percent_change, Observation, PairId, RateTable, RateUpdate};

const DEFAULT_NOTIFY_CAPACITY: usize = 64;

/// Where the service is in its schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// No schedule armed, or no calculator configured
    Idle,
    /// Timer armed, nothing in flight
    Scheduled,
    /// At least one calculation in flight
    Ticking,
}

#[derive(Debug, Default)]
struct ServiceState {
    pairs: Vec<PairId>,
    rates: RateTable,
    error: bool,
}

struct Schedule {
    every: Duration,
    handle: JoinHandle<()>,
}

struct ServiceInner {
    state: RwLock<ServiceState>,
    calculator: RwLock<Option<Arc<dyn RateCalculator>>>,
    schedule: Mutex<Option<Schedule>>,
    in_flight: AtomicUsize,
    updates: broadcast::Sender<RateUpdate>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Ok(mut schedule) = self.schedule.lock() {
            if let Some(schedule) = schedule.take() {
                schedule.handle.abort();
            }
        }
    }
}

/// Cheap-to-clone handle on one aggregation service
#[derive(Clone)]
pub struct RateService {
    inner: Arc<ServiceInner>,
}

impl RateService {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    /// Create a service whose update channel buffers `capacity` snapshots per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(ServiceInner {
                state: RwLock::new(ServiceState::default()),
                calculator: RwLock::new(None),
                schedule: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                updates,
            }),
        }
    }

    pub async fn set_calculator(&self, calculator: Arc<dyn RateCalculator>) {
        tracing::info!(calculator = %calculator.name(), "Calculator configured");
        *self.inner.calculator.write().await = Some(calculator);
    }

    /// Replace the refresh schedule. The previous timer is disarmed before the
    /// new one is armed; a zero interval just disarms.
    pub fn set_refresh_interval(&self, every: Duration) {
        let Ok(mut schedule) = self.inner.schedule.lock() else {
            tracing::error!("Schedule lock poisoned, refresh interval unchanged");
            return;
        };

        if let Some(previous) = schedule.take() {
            previous.handle.abort();
        }

        if every.is_zero() {
            tracing::info!("Refresh schedule disarmed");
            return;
        }

        let handle = spawn_timer(Arc::downgrade(&self.inner), every);
        *schedule = Some(Schedule { every, handle });
        tracing::info!(interval_secs = every.as_secs_f64(), "Refresh schedule armed");
    }

    /// Disarm the refresh schedule
    pub fn stop(&self) {
        self.set_refresh_interval(Duration::ZERO);
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.inner
            .schedule
            .lock()
            .ok()
            .and_then(|schedule| schedule.as_ref().map(|s| s.every))
    }

    pub async fn status(&self) -> ServiceStatus {
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            return ServiceStatus::Ticking;
        }
        let has_calculator = self.inner.calculator.read().await.is_some();
        if has_calculator && self.refresh_interval().is_some() {
            ServiceStatus::Scheduled
        } else {
            ServiceStatus::Idle
        }
    }

    /// Start tracking `pair`. Inserts an empty entry right away and triggers an
    /// out-of-band tick. Returns false, changing nothing, if already tracked.
    pub async fn add_pair(&self, pair: PairId) -> bool {
        {
            let mut state = self.inner.state.write().await;
            if state.pairs.contains(&pair) {
                return false;
            }
            state.pairs.push(pair.clone());
            state.rates.insert(pair.clone(), Observation::empty(&pair));
        }
        tracing::info!(pair = %pair, "Tracking pair");

        let service = self.clone();
        tokio::spawn(async move { service.tick_now().await });
        true
    }

    /// Add several pairs in order; returns how many were new
    pub async fn add_pairs(&self, pairs: Vec<PairId>) -> usize {
        sequence(pairs, |pair| self.add_pair(pair))
            .await
            .into_iter()
            .filter(|added| *added)
            .count()
    }

    /// Stop tracking `pair` and drop its entry. No-op for an untracked pair.
    pub async fn remove_pair(&self, pair: &PairId) -> bool {
        let mut state = self.inner.state.write().await;
        let before = state.pairs.len();
        state.pairs.retain(|p| p != pair);
        state.rates.remove(pair);
        let removed = state.pairs.len() != before;
        if removed {
            tracing::info!(pair = %pair, "Stopped tracking pair");
        }
        removed
    }

    pub async fn tracked_pairs(&self) -> Vec<PairId> {
        self.inner.state.read().await.pairs.clone()
    }

    /// Snapshot of the rate table
    pub async fn rates(&self) -> RateTable {
        self.inner.state.read().await.rates.clone()
    }

    pub async fn get(&self, pair: &PairId) -> Option<Observation> {
        self.inner.state.read().await.rates.get(pair).cloned()
    }

    pub async fn error_flag(&self) -> bool {
        self.inner.state.read().await.error
    }

    /// Operator reset of the error flag
    pub async fn clear_error(&self) {
        self.inner.state.write().await.error = false;
        tracing::info!("Error flag cleared by operator");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RateUpdate> {
        self.inner.updates.subscribe()
    }

    /// Updates as a stream; lagging consumers see `Err(Lagged)` items
    pub fn updates(&self) -> BroadcastStream<RateUpdate> {
        BroadcastStream::new(self.subscribe())
    }

    /// Run one tick now and wait for it to finish
    pub async fn tick_now(&self) {
        let calculator = self.inner.calculator.read().await.clone();
        let Some(calculator) = calculator else {
            tracing::debug!("No calculator configured, skipping tick");
            return;
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.run_tick(calculator).await;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run_tick(&self, calculator: Arc<dyn RateCalculator>) {
        let pairs = self.tracked_pairs().await;
        let outcome = if pairs.is_empty() {
            None
        } else {
            Some(
                calculator
                    .calculate_rates_for(&pairs)
                    .await
                    .and_then(|results| validate_batch(&pairs, results)),
            )
        };

        let update = {
            let mut state = self.inner.state.write().await;
            match outcome {
                None => {}
                Some(Ok(results)) => {
                    let unreachable = merge(&mut state, &pairs, results);
                    if !unreachable.is_empty() {
                        tracing::warn!(
                            calculator = %calculator.name(),
                            pairs = ?unreachable.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                            "Calculator could not reach every pair"
                        );
                    }
                    state.error = !unreachable.is_empty();
                }
                Some(Err(e)) => {
                    tracing::error!(calculator = %calculator.name(), error = %e, "Tick failed, keeping previous rates");
                    state.error = true;
                }
            }
            RateUpdate {
                rates: state.rates.clone(),
                error: state.error,
                published_at: Utc::now(),
            }
        };

        // No subscribers is fine
        let _ = self.inner.updates.send(update);
    }
}

impl Default for RateService {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_timer(service: Weak<ServiceInner>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = service.upgrade() else {
                break;
            };
            let service = RateService { inner };
            tokio::spawn(async move { service.tick_now().await });
        }
    })
}

/// A batch must answer exactly the requested pairs, in order
fn validate_batch(
    pairs: &[PairId],
    results: Vec<Option<Observation>>,
) -> Result<Vec<Option<Observation>>> {
    if results.len() != pairs.len() {
        return Err(RateError::InvalidBatch(format!(
            "requested {} pairs, got {} results",
            pairs.len(),
            results.len()
        )));
    }
    for (pair, result) in pairs.iter().zip(&results) {
        if let Some(obs) = result {
            if !obs.matches(pair) {
                return Err(RateError::InvalidBatch(format!(
                    "requested {}, got {}-{}",
                    pair, obs.origin, obs.target
                )));
            }
        }
    }
    Ok(results)
}

/// Merge a validated batch into the table. Returns the pairs that were unreachable.
fn merge(state: &mut ServiceState, pairs: &[PairId], results: Vec<Option<Observation>>) -> Vec<PairId> {
    let mut unreachable = Vec::new();

    for (pair, result) in pairs.iter().zip(results) {
        // Removed while the tick was in flight
        if !state.pairs.contains(pair) {
            continue;
        }
        match result {
            None => unreachable.push(pair.clone()),
            Some(Observation {
                value: Some(value),
                timestamp,
                ..
            }) => {
                let change = state
                    .rates
                    .get(pair)
                    .and_then(|previous| previous.value)
                    .and_then(|previous| percent_change(previous, value));
                state.rates.insert(
                    pair.clone(),
                    Observation {
                        origin: pair.origin().to_string(),
                        target: pair.target().to_string(),
                        timestamp,
                        value: Some(value),
                        change,
                    },
                );
            }
            // Reached but nothing usable: keep the last known good value
            Some(_) => {}
        }
    }

    unreachable
}
