//! rate-oracle binary
//!
//! Tracks the configured pairs and logs every published update until Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rate_oracle::concurrency::{first_success, sequence};
use rate_oracle::config::AppConfig;
use rate_oracle::{PairId, RateError, RateService, RateSource, RateUpdate};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(config.log.json);
    info!(config = %config.digest(), "Starting rate oracle");

    let pairs = config.service.pair_ids()?;
    let pipeline = config.build_pipeline()?;

    let unsupported = sequence(pairs.clone(), |pair| {
        let sources = &pipeline.sources;
        async move {
            let supported = is_supported(sources, &pair).await;
            (!supported).then_some(pair)
        }
    })
    .await;
    for pair in unsupported.into_iter().flatten() {
        warn!(pair = %pair, "No configured source supports pair");
    }

    let service = RateService::with_capacity(config.service.notify_capacity);
    service.set_calculator(pipeline.calculator).await;

    let mut updates = service.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => log_update(&update),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Update logger lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    service.add_pairs(pairs).await;
    service.set_refresh_interval(config.service.refresh_interval());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping rate oracle...");

    service.stop();
    drop(service);
    logger.abort();

    Ok(())
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// A pair counts as supported when any source says so
async fn is_supported(sources: &[Arc<dyn RateSource>], pair: &PairId) -> bool {
    first_success(sources, |source| async move {
        let supported = source.supports(pair).await?;
        Ok::<_, RateError>(supported.then_some(()))
    })
    .await
    .is_some()
}

fn log_update(update: &RateUpdate) {
    let mut pairs: Vec<_> = update.rates.iter().collect();
    pairs.sort_by(|(a, _), (b, _)| a.cmp(b));

    let summary = pairs
        .iter()
        .map(|(pair, obs)| match (obs.value, obs.change) {
            (Some(value), Some(change)) => format!("{}={} ({:+.2}%)", pair, value, change),
            (Some(value), None) => format!("{}={}", pair, value),
            (None, _) => format!("{}=n/a", pair),
        })
        .collect::<Vec<_>>()
        .join(" ");

    if update.error {
        error!(published_at = %update.published_at, "Rates (degraded): {}", summary);
    } else {
        info!(published_at = %update.published_at, "Rates: {}", summary);
    }
}
