//! Persisted key/value settings. Every operation is async and may fail; the
//! engine treats failures as non-fatal and falls back to defaults.

pub mod memory;
pub mod sqlite;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;

pub use memory::MemorySettings;
pub use sqlite::SqliteSettingsStore;

pub mod keys {
    pub const ACTIVE_CURRENCY: &str = "active_currency";
    pub const CONVERTER_ENABLED: &str = "converter_enabled";
    pub const ENABLED_CURRENCIES: &str = "enabled_currencies";
    pub const MARKETPLACE_ENABLED: &str = "marketplace_enabled";
    pub const ENABLED_MARKETPLACES: &str = "enabled_marketplaces";
    pub const ENERGY_INFO_ENABLED: &str = "energy_info_enabled";

    pub const ALL: [&str; 6] = [
        ACTIVE_CURRENCY,
        CONVERTER_ENABLED,
        ENABLED_CURRENCIES,
        MARKETPLACE_ENABLED,
        ENABLED_MARKETPLACES,
        ENERGY_INFO_ENABLED,
    ];
}

/// Capacity of the change broadcast; lagging listeners just trigger a full reload.
pub const CHANGE_CAPACITY: usize = 64;

pub trait SettingsStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>>;

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>>;

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Keys written through this store, as they change.
    fn changes(&self) -> broadcast::Receiver<String>;
}

/// Typed read with a default for missing, unreadable or mistyped values.
pub async fn read_or<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str, default: T) -> T {
    match store.get(key).await {
        Ok(None) => default,
        Ok(Some(value)) => match serde_json::from_value::<T>(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(%key, "[SETTINGS] mistyped value, using default: {e}");
                default
            }
        },
        Err(e) => {
            warn!(%key, "[SETTINGS] read failed, using default: {e}");
            default
        }
    }
}
