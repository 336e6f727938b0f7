//! The cache worker: install/activate lifecycle, per-request routing and the
//! live-data update detector.

use crate::cache::{CacheGeneration, CacheStorage};
use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::fetch::{FetchError, Fetcher};
use crate::model::{BroadcastKind, CacheKey, FetchRequest, Response, WorkerMessage};
use anyhow::{Context, Result};
use futures::future::join_all;
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("precaching {url} failed: {source}")]
    Precache { url: String, source: FetchError },
    #[error("worker is {actual:?}, expected {expected:?}")]
    InvalidState {
        actual: WorkerState,
        expected: WorkerState,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

/// How a class of requests is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NetworkFirstWithDiff,
    NetworkFirst,
    CacheFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatcher {
    /// Same-origin request for exactly this path (query ignored).
    Path(String),
    /// Request to one of these hosts or their subdomains.
    Hosts(Vec<String>),
    Any,
}

impl RouteMatcher {
    fn matches(&self, url: &Url, origin: &Url) -> bool {
        match self {
            RouteMatcher::Path(path) => same_origin(url, origin) && url.path() == path,
            RouteMatcher::Hosts(hosts) => url.host_str().is_some_and(|host| {
                hosts
                    .iter()
                    .any(|h| host == h || host.ends_with(&format!(".{h}")))
            }),
            RouteMatcher::Any => true,
        }
    }
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Ordered routing table; the first matching route wins.
#[derive(Debug, Clone)]
pub struct StrategyTable {
    routes: Vec<(RouteMatcher, Strategy)>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn route(mut self, matcher: RouteMatcher, strategy: Strategy) -> Self {
        self.routes.push((matcher, strategy));
        self
    }

    /// Live data → diff, CDN hosts → network-first, everything else → cache-first.
    pub fn standard(live_data_path: &str, cdn_hosts: &[String]) -> Self {
        Self::new()
            .route(
                RouteMatcher::Path(live_data_path.to_string()),
                Strategy::NetworkFirstWithDiff,
            )
            .route(RouteMatcher::Hosts(cdn_hosts.to_vec()), Strategy::NetworkFirst)
            .route(RouteMatcher::Any, Strategy::CacheFirst)
    }

    pub fn resolve(&self, url: &Url, origin: &Url) -> Strategy {
        self.routes
            .iter()
            .find(|(m, _)| m.matches(url, origin))
            .map(|(_, s)| *s)
            .unwrap_or(Strategy::CacheFirst)
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub generation: CacheGeneration,
    pub origin: Url,
    pub precache: Vec<String>,
    pub live_data_path: String,
    pub cdn_hosts: Vec<String>,
    pub offline_page: String,
}

impl WorkerConfig {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let origin = Url::parse(&cfg.app.site_url).context("invalid app.site_url")?;
        Ok(Self {
            generation: CacheGeneration::new(&cfg.worker.cache_prefix, &cfg.worker.version),
            origin,
            precache: cfg.worker.precache.clone(),
            live_data_path: cfg.worker.live_data_path.clone(),
            cdn_hosts: cfg.worker.cdn_hosts.clone(),
            offline_page: cfg.worker.offline_page.clone(),
        })
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .with_context(|| format!("invalid path {path}"))
    }
}

/// Result of comparing a freshly fetched live-data body with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheckOutcome {
    /// Nothing was cached yet; the copy was stored silently.
    Stored,
    Unchanged,
    Updated { notified: usize },
    /// The network could not be reached; nothing changed.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted: Vec<String>,
    pub claimed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Checked(UpdateCheckOutcome),
    Activated(Option<ActivationReport>),
}

pub struct CacheWorker {
    config: WorkerConfig,
    table: StrategyTable,
    caches: Arc<dyn CacheStorage>,
    network: Arc<dyn Fetcher>,
    clients: Arc<ClientRegistry>,
    state: Mutex<WorkerState>,
}

impl CacheWorker {
    pub fn new(
        config: WorkerConfig,
        caches: Arc<dyn CacheStorage>,
        network: Arc<dyn Fetcher>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        let table = StrategyTable::standard(&config.live_data_path, &config.cdn_hosts);
        Self {
            config,
            table,
            caches,
            network,
            clients,
            state: Mutex::new(WorkerState::Parsed),
        }
    }

    /// Replace the default routing table.
    pub fn with_strategies(mut self, table: StrategyTable) -> Self {
        self.table = table;
        self
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn generation(&self) -> &CacheGeneration {
        &self.config.generation
    }

    pub fn generation_name(&self) -> String {
        self.config.generation.name()
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.lock().await
    }

    async fn transition(&self, expected: WorkerState, next: WorkerState) -> Result<(), WorkerError> {
        let mut guard = self.state.lock().await;
        if *guard != expected {
            return Err(WorkerError::InvalidState {
                actual: *guard,
                expected,
            });
        }
        *guard = next;
        Ok(())
    }

    /// Populate the current generation with the precache manifest. Any
    /// failure discards the partially filled generation.
    #[instrument(skip_all, fields(generation = %self.config.generation.name()))]
    pub async fn install(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)
            .await?;
        match self.precache().await {
            Ok(count) => {
                *self.state.lock().await = WorkerState::Installed;
                info!(count, "worker installed");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "install failed");
                let name = self.config.generation.name();
                if let Err(cleanup) = self.caches.delete(&name).await {
                    warn!(?cleanup, "failed to discard partial generation");
                }
                *self.state.lock().await = WorkerState::Redundant;
                Err(err)
            }
        }
    }

    async fn precache(&self) -> Result<usize, WorkerError> {
        let name = self.config.generation.name();
        self.caches.open(&name).await?;
        let requests = self
            .config
            .precache
            .iter()
            .map(|path| self.config.resolve(path).map(FetchRequest::get))
            .collect::<Result<Vec<_>>>()?;
        let responses = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

        for (req, res) in requests.iter().zip(responses) {
            let response = match res {
                Ok(r) if r.is_success() => r,
                Ok(r) => {
                    return Err(WorkerError::Precache {
                        url: req.url.to_string(),
                        source: FetchError::Status(r.status),
                    })
                }
                Err(source) => {
                    return Err(WorkerError::Precache {
                        url: req.url.to_string(),
                        source,
                    })
                }
            };
            self.caches.put(&name, &req.cache_key(), &response).await?;
        }
        Ok(requests.len())
    }

    /// Drop every stale generation and take control of all open pages.
    #[instrument(skip_all, fields(generation = %self.config.generation.name()))]
    pub async fn activate(&self) -> Result<ActivationReport, WorkerError> {
        self.transition(WorkerState::Installed, WorkerState::Activating)
            .await?;
        let mut deleted = Vec::new();
        for name in self.caches.keys().await? {
            if !self.config.generation.is_current(&name) && self.caches.delete(&name).await? {
                info!(stale = %name, "deleted stale cache generation");
                deleted.push(name);
            }
        }
        let claimed = self.clients.claim().await;
        *self.state.lock().await = WorkerState::Activated;

        if !deleted.is_empty() {
            let message = format!(
                "Version {} is now active. Reload to use it.",
                self.config.generation.version()
            );
            self.clients
                .broadcast(BroadcastKind::NewVersionAvailable, message)
                .await;
        }
        info!(claimed, deleted = deleted.len(), "worker activated");
        Ok(ActivationReport { deleted, claimed })
    }

    /// Activate a waiting worker right away. No-op in any other state.
    pub async fn skip_waiting(&self) -> Result<Option<ActivationReport>, WorkerError> {
        if self.state().await == WorkerState::Installed {
            return self.activate().await.map(Some);
        }
        Ok(None)
    }

    pub async fn handle_message(&self, message: WorkerMessage) -> Result<MessageOutcome, WorkerError> {
        debug!(?message, "worker message");
        match message {
            WorkerMessage::CheckUpdate => Ok(MessageOutcome::Checked(self.check_for_updates().await)),
            WorkerMessage::SkipWaiting => Ok(MessageOutcome::Activated(self.skip_waiting().await?)),
        }
    }

    pub fn strategy_for(&self, request: &FetchRequest) -> Strategy {
        self.table.resolve(&request.url, &self.config.origin)
    }

    /// Serve an intercepted request.
    #[instrument(skip_all, fields(url = %request.url))]
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        if !request.method.eq_ignore_ascii_case("GET") {
            return self.network.fetch(request).await;
        }
        match self.strategy_for(request) {
            Strategy::NetworkFirstWithDiff => self.network_first_with_diff(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn cached(&self, key: &CacheKey) -> Option<Response> {
        match self.caches.match_any(key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(?err, url = %key.url, "cache lookup failed");
                None
            }
        }
    }

    async fn store(&self, key: &CacheKey, response: &Response) {
        let name = self.config.generation.name();
        if let Err(err) = self.caches.put(&name, key, response).await {
            warn!(?err, url = %key.url, "cache write failed");
        }
    }

    async fn cache_first(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        let key = request.cache_key();
        if let Some(hit) = self.cached(&key).await {
            debug!("cache hit");
            return Ok(hit);
        }
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(&key, &response).await;
                }
                Ok(response)
            }
            Err(err) if request.is_navigation() => {
                let offline = self
                    .config
                    .resolve(&self.config.offline_page)
                    .map_err(|e| FetchError::Storage(e.to_string()))?;
                match self.cached(&CacheKey::new("GET", offline.as_str())).await {
                    Some(page) => {
                        info!("serving offline page");
                        Ok(page)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn network_first(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        let key = request.cache_key();
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(&key, &response).await;
                }
                Ok(response)
            }
            Err(err) => {
                warn!(error = %err, "network failed; trying cache");
                self.cached(&key).await.ok_or(err)
            }
        }
    }

    fn live_key(&self, url: &Url) -> CacheKey {
        let mut bare = url.clone();
        bare.set_query(None);
        bare.set_fragment(None);
        CacheKey::new("GET", bare.as_str())
    }

    async fn network_first_with_diff(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        let key = self.live_key(&request.url);
        let fresh = self.network.fetch(&request.clone().no_store()).await;
        match fresh {
            Ok(response) if response.is_success() => {
                self.diff_and_store(&key, &response).await;
                Ok(response)
            }
            Ok(response) => {
                warn!(status = response.status, "live data returned an error status");
                Ok(self.cached(&key).await.unwrap_or(response))
            }
            Err(err) => {
                warn!(error = %err, "live data unreachable; trying cache");
                self.cached(&key).await.ok_or(err)
            }
        }
    }

    async fn diff_and_store(&self, key: &CacheKey, fresh: &Response) -> UpdateCheckOutcome {
        match self.cached(key).await {
            None => {
                self.store(key, fresh).await;
                UpdateCheckOutcome::Stored
            }
            Some(prior) if prior.body == fresh.body => UpdateCheckOutcome::Unchanged,
            Some(_) => {
                self.store(key, fresh).await;
                let notified = self
                    .clients
                    .broadcast(
                        BroadcastKind::UpdateDetected,
                        "New market data is available.",
                    )
                    .await;
                info!(url = %key.url, notified, "live data changed");
                UpdateCheckOutcome::Updated { notified }
            }
        }
    }

    /// Explicitly triggered diff of the live-data resource.
    #[instrument(skip_all)]
    pub async fn check_for_updates(&self) -> UpdateCheckOutcome {
        let url = match self.config.resolve(&self.config.live_data_path) {
            Ok(url) => url,
            Err(err) => {
                warn!(?err, "cannot resolve live data path");
                return UpdateCheckOutcome::Unavailable;
            }
        };
        let request = FetchRequest::get(url).no_store();
        match self.network.fetch(&request).await {
            Ok(response) if response.is_success() => {
                self.diff_and_store(&self.live_key(&request.url), &response)
                    .await
            }
            Ok(response) => {
                warn!(status = response.status, "update check got error status");
                UpdateCheckOutcome::Unavailable
            }
            Err(err) => {
                warn!(error = %err, "update check failed");
                UpdateCheckOutcome::Unavailable
            }
        }
    }
}
