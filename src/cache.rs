//! Versioned cache storage.
//!
//! A cache *generation* is a named bucket of `(method, url) -> response`
//! entries. The worker writes only to the current generation and drops every
//! other generation on activation.

use crate::db;
use crate::model::{CacheKey, Response};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Name of a cache generation: a fixed prefix plus an embedded version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
    prefix: String,
    version: String,
}

impl CacheGeneration {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-v{}", self.prefix, self.version)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether `name` is this generation.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.name()
    }

    /// Extract the version from a generation name carrying this prefix.
    pub fn version_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.prefix.as_str())?.strip_prefix("-v")
    }
}

#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// All generation names, oldest first.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Create the generation if it does not exist yet.
    async fn open(&self, generation: &str) -> Result<()>;

    async fn match_in(&self, generation: &str, key: &CacheKey) -> Result<Option<Response>>;

    /// Look the key up in every generation, newest first.
    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>>;

    async fn put(&self, generation: &str, key: &CacheKey, response: &Response) -> Result<()>;

    /// Delete a generation and its entries. Returns whether it existed.
    async fn delete(&self, generation: &str) -> Result<bool>;
}

/// Cache storage held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    // Vec keeps creation order so `match_any` can prefer newer generations.
    generations: RwLock<Vec<(String, HashMap<CacheKey, Response>)>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, generation: &str) -> usize {
        let guard = self.generations.read().await;
        guard
            .iter()
            .find(|(name, _)| name == generation)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        let guard = self.generations.read().await;
        Ok(guard.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn open(&self, generation: &str) -> Result<()> {
        let mut guard = self.generations.write().await;
        if !guard.iter().any(|(name, _)| name == generation) {
            guard.push((generation.to_string(), HashMap::new()));
        }
        Ok(())
    }

    async fn match_in(&self, generation: &str, key: &CacheKey) -> Result<Option<Response>> {
        let guard = self.generations.read().await;
        Ok(guard
            .iter()
            .find(|(name, _)| name == generation)
            .and_then(|(_, entries)| entries.get(key).cloned()))
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>> {
        let guard = self.generations.read().await;
        Ok(guard
            .iter()
            .rev()
            .find_map(|(_, entries)| entries.get(key).cloned()))
    }

    async fn put(&self, generation: &str, key: &CacheKey, response: &Response) -> Result<()> {
        let mut guard = self.generations.write().await;
        let idx = match guard.iter().position(|(name, _)| name == generation) {
            Some(idx) => idx,
            None => {
                guard.push((generation.to_string(), HashMap::new()));
                guard.len() - 1
            }
        };
        guard[idx].1.insert(key.clone(), response.clone());
        Ok(())
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        let mut guard = self.generations.write().await;
        let before = guard.len();
        guard.retain(|(name, _)| name != generation);
        Ok(guard.len() != before)
    }
}

/// Cache storage persisted in the SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteCacheStorage {
    pool: db::Pool,
}

impl SqliteCacheStorage {
    pub fn new(pool: db::Pool) -> Self {
        Self { pool }
    }
}

fn response_from_row(row: db::CacheEntryRow) -> Result<Response> {
    let headers: Vec<(String, String)> =
        serde_json::from_str(&row.headers).context("corrupt cached headers")?;
    Ok(Response {
        status: u16::try_from(row.status).context("cached status out of range")?,
        headers,
        body: row.body,
    })
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        db::generation_names(&self.pool).await
    }

    async fn open(&self, generation: &str) -> Result<()> {
        db::open_generation(&self.pool, generation).await
    }

    async fn match_in(&self, generation: &str, key: &CacheKey) -> Result<Option<Response>> {
        db::get_entry(&self.pool, generation, key)
            .await?
            .map(response_from_row)
            .transpose()
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>> {
        db::find_entry_any(&self.pool, key)
            .await?
            .map(response_from_row)
            .transpose()
    }

    async fn put(&self, generation: &str, key: &CacheKey, response: &Response) -> Result<()> {
        db::put_entry(&self.pool, generation, key, response).await
    }

    async fn delete(&self, generation: &str) -> Result<bool> {
        db::delete_generation(&self.pool, generation).await
    }
}
