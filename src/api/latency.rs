//! In-memory latency histogram for reconciliation passes.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Values stored in microseconds, 1us to 100s at 3 significant figures.
pub struct LatencyStats {
    inner: Mutex<Option<hdrhistogram::Histogram<u64>>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: Option<u64>,
    pub p95_us: Option<u64>,
    pub p99_us: Option<u64>,
    pub max_us: Option<u64>,
}

impl LatencyStats {
    pub fn new() -> Self {
        let histogram = match hdrhistogram::Histogram::new_with_bounds(1, 100_000_000, 3) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("[LATENCY] histogram disabled: {e}");
                None
            }
        };
        Self { inner: Mutex::new(histogram) }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().clamp(1, 100_000_000) as u64;
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                let _ = h.record(us);
            }
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let Ok(guard) = self.inner.lock() else {
            return LatencySummary::default();
        };
        match guard.as_ref() {
            Some(h) if h.len() > 0 => LatencySummary {
                samples: h.len(),
                p50_us: Some(h.value_at_quantile(0.5)),
                p95_us: Some(h.value_at_quantile(0.95)),
                p99_us: Some(h.value_at_quantile(0.99)),
                max_us: Some(h.max()),
            },
            _ => LatencySummary::default(),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.len()))
            .unwrap_or(0)
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
