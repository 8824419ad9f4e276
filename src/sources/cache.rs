//! Response caching for HTTP rate sources
//!
//! `TtlCache` serves a previous response for a fixed window; `Inflight` merges
//! concurrent identical requests into a single upstream call.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time-bounded response cache. A zero window disables caching.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value for `key` if it is still inside the validity window
    pub fn get(&self, key: &K) -> Option<V> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            let ttl = self.ttl;
            entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
            entries.insert(key, (Instant::now(), value));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// De-duplicates concurrent requests for the same key.
///
/// The first caller's future is shared with every caller that arrives while it
/// is pending. Once it settles the entry is dropped, so later calls go upstream again.
pub struct Inflight<K, V: Clone> {
    pending: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Inflight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Await the pending request for `key`, starting one with `start` if none is running
    pub async fn run<F>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        // Only polled if it wins the slot
        let fresh = start().shared();
        let shared = self
            .pending
            .lock()
            .ok()
            .map(|mut pending| pending.entry(key.clone()).or_insert(fresh.clone()).clone())
            .unwrap_or(fresh);

        let outcome = shared.clone().await;

        if let Ok(mut pending) = self.pending.lock() {
            let settled = pending
                .get(&key)
                .map(|current| current.ptr_eq(&shared))
                .unwrap_or(false);
            if settled {
                pending.remove(&key);
            }
        }

        outcome
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl<K, V> Default for Inflight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ttl_cache_serves_fresh_entries() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("BTC", 1);
        assert_eq!(cache.get(&"BTC"), Some(1));
        assert_eq!(cache.get(&"ETH"), None);

        cache.clear();
        assert_eq!(cache.get(&"BTC"), None);
    }

    #[test]
    fn test_ttl_cache_expires() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("BTC", 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"BTC"), None);
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert("BTC", 1);
        assert_eq!(cache.get(&"BTC"), None);
    }

    #[tokio::test]
    async fn test_inflight_shares_one_request() {
        let inflight: Arc<Inflight<&'static str, u32>> = Arc::new(Inflight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| {
            move || -> BoxFuture<'static, u32> {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    7
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            inflight.run("BTC", make(calls.clone())),
            inflight.run("BTC", make(calls.clone()))
        );

        assert_eq!((a, b), (7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(inflight.pending_count(), 0);

        // Settled requests are not reused
        inflight.run("BTC", make(calls.clone())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
