use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast;
use tracing::info;

use super::{SettingsStore, CHANGE_CAPACITY};
use crate::error::{OverlayError, Result};

/// Settings persisted in a single SQLite table, values stored as JSON text.
pub struct SqliteSettingsStore {
    pool: SqlitePool,
    changes: broadcast::Sender<String>,
}

impl SqliteSettingsStore {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{path}?mode=rwc")).await?;
        let store = Self::from_pool(pool).await?;
        info!("Settings database ready at {path}");
        Ok(store)
    }

    /// Single-connection in-memory database; every connection would otherwise get its own.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self { pool, changes })
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(OverlayError::from)).transpose()
    }

    async fn write(&self, key: &str, value: Value) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(encoded)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            let _ = self.changes.send(key.to_string());
        }
        Ok(())
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(self.read(key))
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(key, value))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.delete(key))
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::keys;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_read_and_delete() {
        let store = SqliteSettingsStore::in_memory().await.unwrap();
        let mut rx = store.changes();

        assert_eq!(store.get(keys::ENABLED_CURRENCIES).await.unwrap(), None);
        store.set(keys::ENABLED_CURRENCIES, json!(["usd", "sol"])).await.unwrap();
        store.set(keys::ENABLED_CURRENCIES, json!(["eur"])).await.unwrap();
        assert_eq!(store.get(keys::ENABLED_CURRENCIES).await.unwrap(), Some(json!(["eur"])));
        assert_eq!(rx.recv().await.unwrap(), keys::ENABLED_CURRENCIES);

        store.remove(keys::ENABLED_CURRENCIES).await.unwrap();
        assert_eq!(store.get(keys::ENABLED_CURRENCIES).await.unwrap(), None);
    }
}
