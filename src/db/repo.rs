use super::model::CacheEntryRow;
use crate::model::{CacheKey, Response};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs and
/// other schemes pass through untouched.
pub(crate) fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- durable client storage ------------------------------------------------

#[instrument(skip_all)]
pub async fn kv_get(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn kv_set(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn kv_remove(pool: &Pool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM kv_store WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn kv_keys(pool: &Pool) -> Result<Vec<String>> {
    let keys = sqlx::query_scalar::<_, String>("SELECT key FROM kv_store ORDER BY key")
        .fetch_all(pool)
        .await?;
    Ok(keys)
}

// ---- cache generations -----------------------------------------------------

#[instrument(skip_all)]
pub async fn generation_names(pool: &Pool) -> Result<Vec<String>> {
    let names =
        sqlx::query_scalar::<_, String>("SELECT name FROM cache_generations ORDER BY rowid")
            .fetch_all(pool)
            .await?;
    Ok(names)
}

#[instrument(skip_all)]
pub async fn open_generation(pool: &Pool, name: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop a generation and all of its entries. Returns whether it existed.
#[instrument(skip_all)]
pub async fn delete_generation(pool: &Pool, name: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM cache_entries WHERE generation = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM cache_generations WHERE name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() > 0)
}

fn entry_from_row(row: &SqliteRow) -> CacheEntryRow {
    CacheEntryRow {
        status: row.get("status"),
        headers: row.get("headers"),
        body: row.get("body"),
    }
}

#[instrument(skip_all)]
pub async fn get_entry(pool: &Pool, generation: &str, key: &CacheKey) -> Result<Option<CacheEntryRow>> {
    let row = sqlx::query(
        "SELECT status, headers, body FROM cache_entries \
         WHERE generation = ? AND method = ? AND url = ?",
    )
    .bind(generation)
    .bind(&key.method)
    .bind(&key.url)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(entry_from_row))
}

/// Look the key up across every generation, newest generation first.
#[instrument(skip_all)]
pub async fn find_entry_any(pool: &Pool, key: &CacheKey) -> Result<Option<CacheEntryRow>> {
    let row = sqlx::query(
        "SELECT e.status, e.headers, e.body FROM cache_entries e \
         JOIN cache_generations g ON g.name = e.generation \
         WHERE e.method = ? AND e.url = ? ORDER BY g.rowid DESC LIMIT 1",
    )
    .bind(&key.method)
    .bind(&key.url)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(entry_from_row))
}

#[instrument(skip_all)]
pub async fn put_entry(pool: &Pool, generation: &str, key: &CacheKey, response: &Response) -> Result<()> {
    let headers =
        serde_json::to_string(&response.headers).context("failed to encode cached headers")?;
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT OR IGNORE INTO cache_generations (name, created_at) VALUES (?, ?)")
        .bind(generation)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO cache_entries (generation, method, url, status, headers, body, stored_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(generation, method, url) DO UPDATE SET \
         status = excluded.status, headers = excluded.headers, body = excluded.body, \
         stored_at = excluded.stored_at",
    )
    .bind(generation)
    .bind(&key.method)
    .bind(&key.url)
    .bind(i64::from(response.status))
    .bind(headers)
    .bind(&response.body)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_entries(pool: &Pool, generation: &str) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE generation = ?")
        .bind(generation)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}
