use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{SettingsStore, CHANGE_CAPACITY};
use crate::error::{OverlayError, Result};

/// Process-local settings. Writes can be made to fail, or to land late, for
/// exercising the non-fatal persistence paths.
pub struct MemorySettings {
    values: DashMap<String, Value>,
    changes: broadcast::Sender<String>,
    fail_writes: AtomicBool,
    slow_value: Mutex<Option<(Value, Duration)>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            values: DashMap::new(),
            changes,
            fail_writes: AtomicBool::new(false),
            slow_value: Mutex::new(None),
        }
    }

    pub fn with_values<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let store = Self::new();
        for (k, v) in pairs {
            store.values.insert(k.to_string(), v);
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Every write of `value` sleeps for `delay` before it lands.
    pub fn delay_writes_of(&self, value: Value, delay: Duration) {
        if let Ok(mut slot) = self.slow_value.lock() {
            *slot = Some((value, delay));
        }
    }

    fn write_delay(&self, value: &Value) -> Option<Duration> {
        let slot = self.slow_value.lock().ok()?;
        slot.as_ref().filter(|(v, _)| v == value).map(|(_, d)| *d)
    }

    /// Current raw value, bypassing the async interface.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.clone())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(OverlayError::Settings("store is read-only".to_string()));
        }
        Ok(())
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore for MemorySettings {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move { Ok(self.peek(key)) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(delay) = self.write_delay(&value) {
                tokio::time::sleep(delay).await;
            }
            self.check_writable()?;
            self.values.insert(key.to_string(), value);
            let _ = self.changes.send(key.to_string());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_writable()?;
            if self.values.remove(key).is_some() {
                let _ = self.changes.send(key.to_string());
            }
            Ok(())
        })
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{keys, read_or};
    use serde_json::json;

    #[tokio::test]
    async fn set_notifies_and_reads_back() {
        let store = MemorySettings::new();
        let mut rx = store.changes();
        store.set(keys::CONVERTER_ENABLED, json!(false)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), keys::CONVERTER_ENABLED);
        assert!(!read_or(&store, keys::CONVERTER_ENABLED, true).await);
    }

    #[tokio::test]
    async fn mistyped_value_falls_back() {
        let store = MemorySettings::with_values([(keys::ENERGY_INFO_ENABLED, json!("yes"))]);
        assert!(read_or(&store, keys::ENERGY_INFO_ENABLED, true).await);
    }

    #[tokio::test]
    async fn failing_writes_leave_values() {
        let store = MemorySettings::with_values([(keys::ACTIVE_CURRENCY, json!("eur"))]);
        store.set_fail_writes(true);
        assert!(store.set(keys::ACTIVE_CURRENCY, json!("usd")).await.is_err());
        assert!(store.remove(keys::ACTIVE_CURRENCY).await.is_err());
        assert_eq!(store.peek(keys::ACTIVE_CURRENCY), Some(json!("eur")));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_value_lands_after_later_writes() {
        let store = std::sync::Arc::new(MemorySettings::new());
        store.delay_writes_of(json!("eur"), Duration::from_millis(200));
        let slow = {
            let store = store.clone();
            tokio::spawn(async move { store.set(keys::ACTIVE_CURRENCY, json!("eur")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set(keys::ACTIVE_CURRENCY, json!("sol")).await.unwrap();
        assert_eq!(store.peek(keys::ACTIVE_CURRENCY), Some(json!("sol")));
        slow.await.unwrap().unwrap();
        assert_eq!(store.peek(keys::ACTIVE_CURRENCY), Some(json!("eur")));
    }
}
