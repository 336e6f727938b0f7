//! Durable client storage: a flat namespace of string values shared by every
//! page of the site. Writers from different pages race; the last write wins.

use crate::db;
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Storage keys. Values are plain strings; lists are JSON arrays.
pub mod keys {
    pub const NOTIFICATIONS_ENABLED: &str = "peakdip_notifications_enabled";
    pub const NOTIFIED_ARTICLES: &str = "peakdip_notified_articles";
    pub const ARTICLES_CACHE: &str = "peakdip_articles_cache";
    pub const ARTICLES_CACHE_TIME: &str = "peakdip_articles_cache_time";
    pub const READING_LIST: &str = "peakdip_reading_list";
    pub const LAST_UPDATE_CHECK: &str = "peakdip_last_update_check";

    const UPDATE_DISMISSED_PREFIX: &str = "peakdip_update_dismissed_";

    pub fn update_dismissed(version: &str) -> String {
        format!("{UPDATE_DISMISSED_PREFIX}{version}")
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;
    async fn set_item(&self, key: &str, value: &str) -> Result<()>;
    async fn remove_item(&self, key: &str) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Read a value, treating storage errors as absence.
pub async fn read_string(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get_item(key).await {
        Ok(v) => v,
        Err(err) => {
            warn!(?err, key, "storage read failed");
            None
        }
    }
}

/// Read and decode a JSON value. Missing or unparsable data yields `None`.
pub async fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = read_string(store, key).await?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(err) => {
            debug!(%err, key, "discarding malformed stored value");
            None
        }
    }
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set_item(key, &raw).await
}

pub async fn read_flag(store: &dyn KeyValueStore, key: &str) -> bool {
    read_string(store, key).await.as_deref() == Some("true")
}

pub async fn write_flag(store: &dyn KeyValueStore, key: &str, value: bool) -> Result<()> {
    store
        .set_item(key, if value { "true" } else { "false" })
        .await
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.lock().await.keys().cloned().collect())
    }
}

/// Store persisted in the `kv_store` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: db::Pool,
}

impl SqliteStore {
    pub fn new(pool: db::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        db::kv_get(&self.pool, key).await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        db::kv_set(&self.pool, key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        db::kv_remove(&self.pool, key).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        db::kv_keys(&self.pool).await
    }
}
