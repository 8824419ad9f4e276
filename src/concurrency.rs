//! Async orchestration helpers
//!
//! - `sequence`: one operation after another, in input order
//! - `join_all`: everything at once, one outcome slot per input
//! - `first_success`: ordered failover, stops at the first usable answer

use futures_util::future;
use std::fmt::Display;
use std::future::Future;

/// Run `op` for each item strictly in order, each call awaiting the previous one.
pub async fn sequence<I, T, F, Fut, R>(items: I, mut op: F) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    let mut results = Vec::new();
    for item in items {
        results.push(op(item).await);
    }
    results
}

/// Run `op` for every item concurrently.
///
/// Resolves with one slot per item in input order, whatever the completion
/// order was. A failing item only fills its own slot with the error.
pub async fn join_all<I, T, F, Fut, V, E>(items: I, op: F) -> Vec<Result<V, E>>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    future::join_all(items.into_iter().map(op)).await
}

/// Try `op` against each item in order until one yields `Ok(Some(_))`.
///
/// `Ok(None)` and `Err(_)` both move on to the next item; errors are logged and
/// swallowed. Returns `None` once every item is exhausted (immediately for no items).
pub async fn first_success<I, T, F, Fut, V, E>(items: I, mut op: F) -> Option<V>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
    E: Display,
{
    for (attempt, item) in items.into_iter().enumerate() {
        match op(item).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => {
                tracing::trace!(attempt, "No result, trying next candidate");
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Candidate failed, trying next");
            }
        }
    }
    None
}
