use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    Other,
}

/// Transport-level cache behaviour requested by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CacheMode {
    Default,
    NoStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: Url,
    pub mode: RequestMode,
    pub cache: CacheMode,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".into(),
            url,
            mode: RequestMode::Other,
            cache: CacheMode::Default,
        }
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn no_store(mut self) -> Self {
        self.cache = CacheMode::NoStore;
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, self.url.as_str())
    }
}

/// Identity of a cache entry: request method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }
}

/// Captured response: what the network returned and what the cache stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastKind {
    UpdateDetected,
    NewVersionAvailable,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastKind::UpdateDetected => "update-detected",
            BroadcastKind::NewVersionAvailable => "new-version-available",
        }
    }
}

/// Message posted from the worker to every controlled client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: BroadcastKind,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub action: String,
}

/// Control messages a page posts to the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    CheckUpdate,
    SkipWaiting,
}

/// Article metadata as served by the site's `articles.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Article {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub slug: String,
    pub date: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub reading_time: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

impl Article {
    /// Publish date; accepts `YYYY-MM-DD` or a full RFC 3339 timestamp.
    pub fn published_on(&self) -> Option<NaiveDate> {
        let raw = self.date.trim();
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|d| d.with_timezone(&Utc).date_naive())
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArticleMetadata {
    #[serde(default)]
    pub articles: Vec<Article>,
}

fn number_or_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// An article saved for later reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingListItem {
    pub id: String,
    pub title: String,
    pub url: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationData {
    pub url: String,
    #[serde(default)]
    pub article_ids: Vec<String>,
}

/// User-facing notification handed to a notification surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
    pub data: NotificationData,
}
