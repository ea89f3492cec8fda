use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{OverlayError, Result};
use crate::rates::math::{self, Converted};
use crate::rates::relay::RateRelay;
use crate::types::{conversion_spec, RateSnapshot, CONVERSIONS};

/// Holds at most one rate snapshot. Readers clone the `Arc`; a successful
/// fetch swaps the whole snapshot, a failed one leaves it untouched.
pub struct RateCache {
    relay: Arc<dyn RateRelay>,
    base_token: String,
    /// Base token first, then every token conversion's address.
    tracked: Vec<String>,
    timeout: Duration,
    snapshot: RwLock<Option<Arc<RateSnapshot>>>,
}

impl RateCache {
    pub fn new(relay: Arc<dyn RateRelay>, base_token: impl Into<String>, timeout: Duration) -> Self {
        let base_token = base_token.into();
        let mut tracked = vec![base_token.clone()];
        for addr in CONVERSIONS.iter().filter_map(|c| c.token_address) {
            if !tracked.iter().any(|t| t == addr) {
                tracked.push(addr.to_string());
            }
        }
        Self { relay, base_token, tracked, timeout, snapshot: RwLock::new(None) }
    }

    /// One relay call for every tracked address.
    pub async fn fetch_all(&self) -> Result<Arc<RateSnapshot>> {
        let fetched = tokio::time::timeout(self.timeout, self.relay.fetch_rates(&self.tracked))
            .await
            .map_err(|_| OverlayError::Timeout(self.timeout.as_millis() as u64))
            .and_then(|r| r);

        match fetched {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.write() = Some(Arc::clone(&snapshot));
                info!(tokens = snapshot.len(), "[RATES] snapshot replaced");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(
                    cached = self.is_populated(),
                    "[RATES] fetch failed, keeping previous snapshot: {e}"
                );
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> Option<Arc<RateSnapshot>> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_populated(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn convert(&self, key: &str, balance_text: &str) -> Result<Converted> {
        let spec = conversion_spec(key).ok_or_else(|| OverlayError::InvalidConversion(key.to_string()))?;
        let snapshot = self.snapshot().ok_or(OverlayError::CacheEmpty)?;
        math::convert(&snapshot, &self.base_token, spec, balance_text)
    }

    /// Drops the snapshot at session end.
    pub fn invalidate(&self) {
        *self.write() = None;
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<RateSnapshot>>> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;

    pub const BASE: &str = "base-token";

    /// Relay that replays queued outcomes; `None` hangs forever.
    pub struct StubRelay {
        pub outcomes: Mutex<Vec<Option<Result<RateSnapshot>>>>,
        pub calls: Mutex<Vec<Vec<String>>>,
    }

    impl StubRelay {
        pub fn new(outcomes: Vec<Option<Result<RateSnapshot>>>) -> Arc<Self> {
            Arc::new(Self { outcomes: Mutex::new(outcomes), calls: Mutex::new(Vec::new()) })
        }
    }

    impl RateRelay for StubRelay {
        fn fetch_rates<'a>(&'a self, addresses: &'a [String]) -> BoxFuture<'a, Result<RateSnapshot>> {
            self.calls.lock().unwrap().push(addresses.to_vec());
            let next = {
                let mut q = self.outcomes.lock().unwrap();
                if q.is_empty() { None } else { q.remove(0) }
            };
            Box::pin(async move {
                match next {
                    Some(r) => r,
                    None => std::future::pending().await,
                }
            })
        }
    }

    pub fn snapshot(base_usd: f64) -> RateSnapshot {
        let sol = conversion_spec("sol").and_then(|s| s.token_address).unwrap();
        HashMap::from([
            (BASE.to_string(), HashMap::from([("usd".to_string(), base_usd), ("eur".to_string(), base_usd * 0.5)])),
            (sol.to_string(), HashMap::from([("usd".to_string(), 0.5)])),
        ])
    }

    pub fn cache_with(outcomes: Vec<Option<Result<RateSnapshot>>>) -> (RateCache, Arc<StubRelay>) {
        let relay = StubRelay::new(outcomes);
        let cache = RateCache::new(relay.clone(), BASE, Duration::from_millis(500));
        (cache, relay)
    }

    #[tokio::test]
    async fn convert_before_fetch_is_cache_empty() {
        let (cache, _) = cache_with(vec![]);
        assert!(matches!(cache.convert("usd", "1"), Err(OverlayError::CacheEmpty)));
        assert!(matches!(cache.convert("doge", "1"), Err(OverlayError::InvalidConversion(_))));
    }

    #[tokio::test]
    async fn fetch_requests_every_tracked_address_once() {
        let (cache, relay) = cache_with(vec![Some(Ok(snapshot(0.02)))]);
        cache.fetch_all().await.unwrap();
        let calls = relay.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], BASE);
        assert_eq!(calls[0].len(), 1 + CONVERSIONS.iter().filter(|c| c.token_address.is_some()).count());
        assert_eq!(cache.convert("usd", "123.45").unwrap().display(), "2.47");
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_snapshot() {
        let (cache, _) = cache_with(vec![
            Some(Ok(snapshot(0.02))),
            Some(Err(OverlayError::Network("down".into()))),
        ]);
        cache.fetch_all().await.unwrap();
        assert!(matches!(cache.fetch_all().await, Err(OverlayError::Network(_))));
        assert_eq!(cache.convert("usd", "100").unwrap().display(), "2.00");
    }

    #[tokio::test]
    async fn next_fetch_replaces_wholesale() {
        let mut second = HashMap::new();
        second.insert(BASE.to_string(), HashMap::from([("usd".to_string(), 0.04)]));
        let (cache, _) = cache_with(vec![Some(Ok(snapshot(0.02))), Some(Ok(second))]);
        cache.fetch_all().await.unwrap();
        cache.fetch_all().await.unwrap();
        assert_eq!(cache.convert("usd", "100").unwrap().display(), "4.00");
        // eur was only in the first snapshot
        assert!(matches!(cache.convert("eur", "100"), Err(OverlayError::RatesUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_relay_times_out() {
        let (cache, _) = cache_with(vec![None]);
        assert!(matches!(cache.fetch_all().await, Err(OverlayError::Timeout(500))));
        assert!(!cache.is_populated());
    }

    #[tokio::test]
    async fn invalidate_discards_snapshot() {
        let (cache, _) = cache_with(vec![Some(Ok(snapshot(0.02)))]);
        cache.fetch_all().await.unwrap();
        cache.invalidate();
        assert!(matches!(cache.convert("usd", "1"), Err(OverlayError::CacheEmpty)));
    }
}
