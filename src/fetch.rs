use crate::model::{CacheMode, FetchRequest, Response};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("cache storage error: {0}")]
    Storage(String),
}

/// The network as seen by the worker and the pollers.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Response, FetchError>;
}

/// Fetch with a deadline; the in-flight request is dropped when it expires.
pub async fn fetch_with_timeout(
    fetcher: &dyn Fetcher,
    request: &FetchRequest,
    timeout: Duration,
) -> Result<Response, FetchError> {
    match tokio::time::timeout(timeout, fetcher.fetch(request)).await {
        Ok(res) => res,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

/// Append a `t=<millis>` query parameter so intermediaries cannot serve a
/// stale copy.
pub fn cache_busted(url: &Url, now_millis: i64) -> Url {
    let mut busted = url.clone();
    busted
        .query_pairs_mut()
        .append_pair("t", &now_millis.to_string());
    busted
}

/// `Fetcher` backed by a real HTTP client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(concat!("peakdip-offline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let mut builder = self.http.request(method, request.url.clone());
        if request.cache == CacheMode::NoStore {
            builder = builder
                .header("Cache-Control", "no-cache, no-store")
                .header("Pragma", "no-cache");
        }
        let res = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(Duration::ZERO)
            } else {
                FetchError::Network(e.to_string())
            }
        })?;
        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = res
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .to_vec();
        debug!(url = %request.url, status, bytes = body.len(), "fetched");
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
