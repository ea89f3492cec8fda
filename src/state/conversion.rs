use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{OverlayError, Result};
use crate::settings::{keys, read_or, SettingsStore};
use crate::types::{conversion_spec, DEFAULT_CONVERSION};

/// The currently selected display currency.
///
/// Always holds a key from the static conversion table. Changes go through
/// [`ConversionState::set`] or [`ConversionState::ensure_enabled`], both of
/// which persist fire-and-forget: the in-memory value is authoritative even
/// when the write fails.
///
/// Writes go through one writer task that only ever persists the newest
/// requested key, so a slow write cannot land after a later one.
pub struct ConversionState {
    active: watch::Sender<String>,
    pending: watch::Sender<Option<(u64, String)>>,
    writes: Arc<WriteProgress>,
}

#[derive(Default)]
struct WriteProgress {
    requested: AtomicU64,
    settled: AtomicU64,
}

impl ConversionState {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        let (active, _) = watch::channel(DEFAULT_CONVERSION.to_string());
        let (pending, pending_rx) = watch::channel(None);
        let writes = Arc::new(WriteProgress::default());
        tokio::spawn(write_latest(store, pending_rx, Arc::clone(&writes)));
        Self { active, pending, writes }
    }

    /// Cold start: restore the persisted choice if it is still a known key.
    pub async fn load(store: Arc<dyn SettingsStore>) -> Self {
        let saved: String = read_or(store.as_ref(), keys::ACTIVE_CURRENCY, DEFAULT_CONVERSION.to_string()).await;
        let state = Self::new(store);
        if conversion_spec(&saved).is_some() {
            state.active.send_replace(saved);
        } else {
            warn!(key = %saved, "[CONVERSION] persisted key unknown, using default");
        }
        state
    }

    pub fn get(&self) -> String {
        self.active.borrow().clone()
    }

    /// Notified on every change of the active key.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.active.subscribe()
    }

    pub fn set(&self, key: &str) -> Result<()> {
        if conversion_spec(key).is_none() {
            return Err(OverlayError::InvalidConversion(key.to_string()));
        }
        let previous = self.active.send_replace(key.to_string());
        if previous != key {
            info!(from = %previous, to = %key, "[CONVERSION] active currency changed");
        }
        self.persist(key.to_string());
        Ok(())
    }

    /// Moves off a key that is no longer enabled. Returns the key now active.
    pub fn ensure_enabled(&self, enabled: &[String]) -> String {
        let current = self.get();
        if enabled.iter().any(|k| *k == current) {
            return current;
        }
        let fallback = enabled
            .iter()
            .find(|k| conversion_spec(k).is_some())
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONVERSION.to_string());
        if fallback != current {
            info!(from = %current, to = %fallback, "[CONVERSION] active currency disabled, falling back");
            self.active.send_replace(fallback.clone());
            self.persist(fallback.clone());
        }
        fallback
    }

    /// True while a requested write has not been attempted yet. The stored
    /// value may lag the in-memory one until this clears.
    pub fn is_persisting(&self) -> bool {
        self.writes.settled.load(Ordering::Acquire) < self.writes.requested.load(Ordering::Acquire)
    }

    fn persist(&self, key: String) {
        let seq = self.writes.requested.fetch_add(1, Ordering::AcqRel) + 1;
        self.pending.send_replace(Some((seq, key)));
    }
}

/// Writer loop: intermediate keys requested while a write is in flight are
/// skipped. Ends when the owning state is dropped.
async fn write_latest(
    store: Arc<dyn SettingsStore>,
    mut pending: watch::Receiver<Option<(u64, String)>>,
    writes: Arc<WriteProgress>,
) {
    while pending.changed().await.is_ok() {
        let latest = pending.borrow_and_update().clone();
        let Some((seq, key)) = latest else {
            continue;
        };
        match store.set(keys::ACTIVE_CURRENCY, json!(key)).await {
            Ok(()) => debug!(%key, seq, "[CONVERSION] persisted"),
            Err(e) => warn!(%key, "[CONVERSION] persisting active currency failed: {e}"),
        }
        writes.settled.store(seq, Ordering::Release);
    }
}
