//! Build version comparison and the "new version available" notifier.

use crate::cache::CacheStorage;
use crate::capabilities::{Capabilities, UpdateChoice};
use crate::clock::Clock;
use crate::fetch::{cache_busted, fetch_with_timeout, Fetcher};
use crate::model::{BroadcastKind, ClientMessage, FetchRequest};
use crate::poll::InFlight;
use crate::storage::{self, keys, KeyValueStore};
use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v?(\d+)\.(\d+)\.(\d+)").expect("valid version regex"));

/// `MAJOR.MINOR.PATCH`; anything after the patch number is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Strictly newer: the first differing component decides.
pub fn is_newer(candidate: &Version, running: &Version) -> bool {
    for (a, b) in [
        (candidate.major, running.major),
        (candidate.minor, running.minor),
        (candidate.patch, running.patch),
    ] {
        if a != b {
            return a > b;
        }
    }
    false
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = VERSION_RE
            .captures(s.trim())
            .ok_or_else(|| anyhow!("not a MAJOR.MINOR.PATCH version: {s:?}"))?;
        let part = |i: usize| -> Result<u64> {
            caps[i]
                .parse()
                .with_context(|| format!("version component out of range in {s:?}"))
        };
        Ok(Version::new(part(1)?, part(2)?, part(3)?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Deserialize)]
struct VersionDoc {
    version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Available { version: Version, label: String },
    Dismissed { version: Version, label: String },
    /// A previous check is still running.
    AlreadyRunning,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResolution {
    Applied,
    Deferred,
}

#[derive(Debug, Clone)]
pub struct UpdateNotifierConfig {
    pub version_url: Url,
    pub current: Version,
    pub check_interval: Duration,
    pub fetch_timeout: Duration,
}

pub struct UpdateNotifier {
    config: UpdateNotifierConfig,
    network: Arc<dyn Fetcher>,
    store: Arc<dyn KeyValueStore>,
    caches: Arc<dyn CacheStorage>,
    caps: Capabilities,
    clock: Arc<dyn Clock>,
    in_flight: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateNotifier {
    pub fn new(
        config: UpdateNotifierConfig,
        network: Arc<dyn Fetcher>,
        store: Arc<dyn KeyValueStore>,
        caches: Arc<dyn CacheStorage>,
        caps: Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            network,
            store,
            caches,
            caps,
            clock,
            in_flight: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    pub fn current_version(&self) -> Version {
        self.config.current
    }

    pub async fn is_dismissed(&self, label: &str) -> bool {
        storage::read_flag(self.store.as_ref(), &keys::update_dismissed(label)).await
    }

    pub async fn dismiss(&self, label: &str) -> Result<()> {
        storage::write_flag(self.store.as_ref(), &keys::update_dismissed(label), true).await
    }

    async fn fetch_remote(&self) -> Result<String> {
        let url = cache_busted(&self.config.version_url, self.clock.now().timestamp_millis());
        let request = FetchRequest::get(url).no_store();
        let response =
            fetch_with_timeout(self.network.as_ref(), &request, self.config.fetch_timeout).await?;
        if !response.is_success() {
            return Err(anyhow!("version endpoint returned {}", response.status));
        }
        let doc: VersionDoc =
            serde_json::from_slice(&response.body).context("invalid version document")?;
        Ok(doc.version)
    }

    /// Fetch the remote version and compare it with the running build.
    /// Overlapping calls are skipped rather than queued.
    #[instrument(skip_all)]
    pub async fn check_for_update(&self) -> UpdateStatus {
        let Some(_running) = InFlight::acquire(&self.in_flight) else {
            debug!("update check already running");
            return UpdateStatus::AlreadyRunning;
        };
        self.check_inner().await
    }

    async fn check_inner(&self) -> UpdateStatus {
        let label = match self.fetch_remote().await {
            Ok(label) => label,
            Err(err) => {
                warn!(?err, "version check failed");
                return UpdateStatus::Failed;
            }
        };
        let now = self.clock.now().timestamp_millis().to_string();
        if let Err(err) = self.store.set_item(keys::LAST_UPDATE_CHECK, &now).await {
            warn!(?err, "failed to record update check time");
        }

        let version = match label.parse::<Version>() {
            Ok(v) => v,
            Err(err) => {
                warn!(?err, "remote version unparsable");
                return UpdateStatus::Failed;
            }
        };
        if !is_newer(&version, &self.config.current) {
            return UpdateStatus::UpToDate;
        }
        if self.is_dismissed(&label).await {
            debug!(%version, "update dismissed earlier");
            return UpdateStatus::Dismissed { version, label };
        }
        info!(%version, current = %self.config.current, "newer version available");
        UpdateStatus::Available { version, label }
    }

    /// Check, and if an undismissed newer version exists, ask the user.
    pub async fn check_and_prompt(&self) -> Option<UpdateResolution> {
        let UpdateStatus::Available { label, .. } = self.check_for_update().await else {
            return None;
        };
        match self.caps.ui.offer_update(&label).await {
            UpdateChoice::UpdateNow => match self.apply_update().await {
                Ok(()) => Some(UpdateResolution::Applied),
                Err(err) => {
                    warn!(?err, "applying update failed");
                    None
                }
            },
            UpdateChoice::Later => {
                if let Err(err) = self.dismiss(&label).await {
                    warn!(?err, "failed to persist dismissal");
                }
                Some(UpdateResolution::Deferred)
            }
        }
    }

    /// Drop every cache generation, unregister the worker and reload.
    #[instrument(skip_all)]
    pub async fn apply_update(&self) -> Result<()> {
        for name in self.caches.keys().await? {
            self.caches.delete(&name).await?;
        }
        self.caps.host.unregister_worker().await?;
        self.caps.host.reload().await?;
        info!("update applied");
        Ok(())
    }

    /// React to a worker broadcast; only `new-version-available` triggers a check.
    pub async fn handle_broadcast(&self, message: &ClientMessage) -> Option<UpdateResolution> {
        if message.kind != BroadcastKind::NewVersionAvailable {
            return None;
        }
        self.check_and_prompt().await
    }

    pub async fn start_polling(self: &Arc<Self>) {
        let mut guard = self.poller.lock().await;
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let every = self.config.check_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                this.check_and_prompt().await;
            }
        }));
        info!(?every, "update polling started");
    }

    pub async fn stop_polling(&self) {
        let Some(handle) = self.poller.lock().await.take() else {
            return;
        };
        handle.abort();
        // Wait until an in-flight cycle has actually been dropped.
        let _ = handle.await;
        info!("update polling stopped");
    }

    pub async fn is_polling(&self) -> bool {
        self.poller.lock().await.is_some()
    }
}
