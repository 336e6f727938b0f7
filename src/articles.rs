//! New-article notifications.
//!
//! The notifier polls the site's article metadata, works out which articles
//! are both recent and not yet announced, and shows one notification for
//! them. Announced IDs are persisted so an article is never announced twice.

use crate::capabilities::{Capabilities, Permission, ToastLevel};
use crate::clock::Clock;
use crate::config::Config;
use crate::fetch::{cache_busted, fetch_with_timeout, Fetcher};
use crate::model::{
    Article, ArticleMetadata, FetchRequest, NotificationAction, NotificationData,
    NotificationPayload,
};
use crate::poll::InFlight;
use crate::storage::{self, keys, KeyValueStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const ICON: &str = "assets/icons/icon-192x192.png";
const BADGE: &str = "assets/icons/badge-72x72.png";
const LIST_PATH: &str = "learn/";
const DIGEST_TAG: &str = "peakdip-new-articles";
const DIGEST_PREVIEW: usize = 3;

#[derive(Debug, Clone)]
pub struct ArticleNotifierConfig {
    pub site_url: Url,
    pub metadata_url: Url,
    pub check_interval: Duration,
    pub new_article_days: i64,
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub debounce: Duration,
}

impl ArticleNotifierConfig {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let site_url = Url::parse(&cfg.app.site_url).context("invalid app.site_url")?;
        let metadata_url = site_url
            .join(&cfg.notifications.metadata_url)
            .context("invalid notifications.metadata_url")?;
        Ok(Self {
            site_url,
            metadata_url,
            check_interval: cfg.notifications.check_interval(),
            new_article_days: cfg.notifications.new_article_days,
            cache_ttl: cfg.notifications.cache_ttl(),
            fetch_timeout: cfg.notifications.fetch_timeout(),
            debounce: cfg.notifications.debounce(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    Enabled,
    AlreadyEnabled,
    Denied,
    /// Ignored: a toggle happened moments ago.
    Debounced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delegated,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Disabled,
    AlreadyRunning,
    NothingNew,
    Notified { ids: Vec<String>, via: Delivery },
    /// Both surfaces failed; the articles stay eligible for the next cycle.
    Undelivered { ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickTarget {
    Article(String),
    List(String),
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierStatus {
    pub enabled: bool,
    pub permission: Permission,
    pub notified: usize,
    pub cached_articles: usize,
    pub polling: bool,
}

/// Articles published within `days` before `today` (inclusive) whose id is
/// not in `notified`. Future-dated and undated articles are never new.
pub fn select_new(
    articles: &[Article],
    notified: &[String],
    today: NaiveDate,
    days: i64,
) -> Vec<Article> {
    articles
        .iter()
        .filter(|a| {
            a.published_on().is_some_and(|d| {
                let age = (today - d).num_days();
                (0..=days).contains(&age)
            })
        })
        .filter(|a| !notified.iter().any(|id| id == &a.id))
        .cloned()
        .collect()
}

pub struct ArticleNotifier {
    config: ArticleNotifierConfig,
    network: Arc<dyn Fetcher>,
    store: Arc<dyn KeyValueStore>,
    caps: Capabilities,
    clock: Arc<dyn Clock>,
    articles: Mutex<Vec<Article>>,
    in_flight: AtomicBool,
    warned_denied: AtomicBool,
    last_toggle: Mutex<Option<(bool, DateTime<Utc>)>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ArticleNotifier {
    pub fn new(
        config: ArticleNotifierConfig,
        network: Arc<dyn Fetcher>,
        store: Arc<dyn KeyValueStore>,
        caps: Capabilities,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            network,
            store,
            caps,
            clock,
            articles: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
            warned_denied: AtomicBool::new(false),
            last_toggle: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        storage::read_flag(self.store.as_ref(), keys::NOTIFICATIONS_ENABLED).await
    }

    /// Restore the persisted state; resumes polling when still permitted.
    #[instrument(skip_all)]
    pub async fn init(self: &Arc<Self>) -> bool {
        if !self.is_enabled().await {
            return false;
        }
        if self.caps.permission.current().await != Permission::Granted {
            info!("notifications enabled but permission no longer granted");
            return false;
        }
        self.start_polling().await;
        true
    }

    /// True when the same toggle (`enabling` or not) happened within the
    /// debounce window. Opposite toggles are never suppressed.
    async fn debounced(&self, enabling: bool) -> bool {
        let now = self.clock.now();
        let mut last = self.last_toggle.lock().await;
        let window =
            chrono::Duration::from_std(self.config.debounce).unwrap_or(chrono::Duration::zero());
        if let Some((prev_enabling, prev)) = *last {
            if prev_enabling == enabling && now - prev < window {
                return true;
            }
        }
        *last = Some((enabling, now));
        false
    }

    #[instrument(skip_all)]
    pub async fn enable(self: &Arc<Self>) -> Result<EnableOutcome> {
        if self.debounced(true).await {
            debug!("enable ignored by debounce");
            return Ok(EnableOutcome::Debounced);
        }
        let was_enabled = self.is_enabled().await;
        if was_enabled && self.caps.permission.current().await == Permission::Granted {
            return Ok(EnableOutcome::AlreadyEnabled);
        }
        if self.caps.permission.request().await != Permission::Granted {
            if was_enabled {
                // Permission was revoked since; clear the stale flag.
                self.stop_polling().await;
                storage::write_flag(self.store.as_ref(), keys::NOTIFICATIONS_ENABLED, false)
                    .await?;
            }
            if !self.warned_denied.swap(true, Ordering::AcqRel) {
                self.caps
                    .ui
                    .toast(
                        "Notifications are blocked. Allow them in your browser settings.",
                        ToastLevel::Warning,
                    )
                    .await;
            }
            info!("notification permission denied");
            return Ok(EnableOutcome::Denied);
        }

        let first_opt_in = self
            .store
            .get_item(keys::NOTIFIED_ARTICLES)
            .await
            .ok()
            .flatten()
            .is_none();
        storage::write_flag(self.store.as_ref(), keys::NOTIFICATIONS_ENABLED, true).await?;
        self.caps
            .ui
            .toast(
                "You'll be notified when new articles are published.",
                ToastLevel::Success,
            )
            .await;

        if first_opt_in {
            self.load_articles(true).await;
            let skipped = self.mark_all_as_notified().await?;
            info!(skipped, "existing articles marked as notified");
        }
        self.start_polling().await;
        Ok(EnableOutcome::Enabled)
    }

    #[instrument(skip_all)]
    pub async fn disable(&self) -> Result<bool> {
        if self.debounced(false).await {
            return Ok(false);
        }
        self.stop_polling().await;
        storage::write_flag(self.store.as_ref(), keys::NOTIFICATIONS_ENABLED, false).await?;
        self.caps
            .ui
            .toast("Article notifications turned off.", ToastLevel::Info)
            .await;
        Ok(true)
    }

    async fn cached_metadata(&self) -> Option<(Vec<Article>, Option<DateTime<Utc>>)> {
        let articles: Vec<Article> =
            storage::read_json(self.store.as_ref(), keys::ARTICLES_CACHE).await?;
        let stamp = storage::read_string(self.store.as_ref(), keys::ARTICLES_CACHE_TIME)
            .await
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        Some((articles, stamp))
    }

    async fn fetch_metadata(&self) -> Result<Vec<Article>> {
        let now = self.clock.now();
        let url = cache_busted(&self.config.metadata_url, now.timestamp_millis());
        let request = FetchRequest::get(url).no_store();
        let response =
            fetch_with_timeout(self.network.as_ref(), &request, self.config.fetch_timeout).await?;
        if !response.is_success() {
            return Err(anyhow!("metadata endpoint returned {}", response.status));
        }
        let meta: ArticleMetadata =
            serde_json::from_slice(&response.body).context("invalid article metadata")?;

        storage::write_json(self.store.as_ref(), keys::ARTICLES_CACHE, &meta.articles).await?;
        self.store
            .set_item(
                keys::ARTICLES_CACHE_TIME,
                &now.timestamp_millis().to_string(),
            )
            .await?;
        Ok(meta.articles)
    }

    /// Load article metadata, preferring a fresh cached copy unless `force`.
    /// Failures fall back to the last good copy and are only logged.
    #[instrument(skip_all, fields(force))]
    pub async fn load_articles(&self, force: bool) -> Vec<Article> {
        let cached = self.cached_metadata().await;
        if !force {
            if let Some((articles, Some(stamp))) = &cached {
                let ttl = chrono::Duration::from_std(self.config.cache_ttl)
                    .unwrap_or(chrono::Duration::zero());
                if self.clock.now() - *stamp < ttl {
                    debug!(count = articles.len(), "using cached article metadata");
                    *self.articles.lock().await = articles.clone();
                    return articles.clone();
                }
            }
        }

        match self.fetch_metadata().await {
            Ok(articles) => {
                debug!(count = articles.len(), "fetched article metadata");
                *self.articles.lock().await = articles.clone();
                articles
            }
            Err(err) => {
                warn!(?err, "article metadata unavailable");
                let mut current = self.articles.lock().await;
                if let Some((articles, _)) = cached {
                    *current = articles;
                }
                current.clone()
            }
        }
    }

    pub async fn notified_ids(&self) -> Vec<String> {
        storage::read_json(self.store.as_ref(), keys::NOTIFIED_ARTICLES)
            .await
            .unwrap_or_default()
    }

    async fn add_notified(&self, ids: &[String]) -> Result<()> {
        let mut set = self.notified_ids().await;
        for id in ids {
            if !set.contains(id) {
                set.push(id.clone());
            }
        }
        storage::write_json(self.store.as_ref(), keys::NOTIFIED_ARTICLES, &set).await
    }

    /// Forget every announced id.
    pub async fn reset_notified(&self) -> Result<()> {
        self.store.remove_item(keys::NOTIFIED_ARTICLES).await
    }

    /// New articles among those currently loaded, as of `today`.
    pub async fn new_articles(&self, today: NaiveDate) -> Vec<Article> {
        let notified = self.notified_ids().await;
        let articles = self.articles.lock().await;
        select_new(&articles, &notified, today, self.config.new_article_days)
    }

    /// Record all current new articles as announced without showing anything.
    pub async fn mark_all_as_notified(&self) -> Result<usize> {
        let fresh = self.new_articles(self.clock.now().date_naive()).await;
        let ids: Vec<String> = fresh.into_iter().map(|a| a.id).collect();
        self.add_notified(&ids).await?;
        Ok(ids.len())
    }

    /// One poll cycle. A cycle that starts while another is running is
    /// skipped.
    #[instrument(skip_all)]
    pub async fn check_for_new_articles(&self, force: bool) -> PollOutcome {
        let Some(_running) = InFlight::acquire(&self.in_flight) else {
            debug!("article check already running");
            return PollOutcome::AlreadyRunning;
        };
        self.poll_once(force).await
    }

    async fn poll_once(&self, force: bool) -> PollOutcome {
        if !self.is_enabled().await {
            return PollOutcome::Disabled;
        }
        self.load_articles(force).await;
        let fresh = self.new_articles(self.clock.now().date_naive()).await;
        if fresh.is_empty() {
            return PollOutcome::NothingNew;
        }
        let ids: Vec<String> = fresh.iter().map(|a| a.id.clone()).collect();

        let rich = if fresh.len() == 1 {
            self.single_payload(&fresh[0])
        } else {
            self.digest_payload(&fresh)
        };
        let via = match self.caps.delegated.show(&rich).await {
            Ok(()) => Some(Delivery::Delegated),
            Err(err) => {
                warn!(?err, "rich notification failed; falling back");
                match self.caps.direct.show(&minimal(&rich, &fresh)).await {
                    Ok(()) => Some(Delivery::Direct),
                    Err(err) => {
                        warn!(?err, "direct notification failed");
                        None
                    }
                }
            }
        };

        let Some(via) = via else {
            return PollOutcome::Undelivered { ids };
        };
        if let Err(err) = self.add_notified(&ids).await {
            warn!(?err, "failed to persist notified ids");
        }
        info!(count = ids.len(), ?via, "new articles announced");
        PollOutcome::Notified { ids, via }
    }

    fn site(&self, path: &str) -> String {
        self.config
            .site_url
            .join(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    pub fn article_url(&self, article: &Article) -> String {
        if article.slug.is_empty() {
            self.site(&format!("learn/article.html?id={}", article.id))
        } else {
            self.site(&format!("learn/{}.html", article.slug))
        }
    }

    pub fn list_url(&self) -> String {
        self.site(LIST_PATH)
    }

    fn single_payload(&self, article: &Article) -> NotificationPayload {
        let mut details = Vec::new();
        if let Some(rt) = &article.reading_time {
            details.push(format!("{rt} min read"));
        }
        if let Some(level) = &article.level {
            details.push(level.clone());
        }
        let body = if details.is_empty() {
            article.title.clone()
        } else {
            format!("{}\n{}", article.title, details.join(" · "))
        };
        NotificationPayload {
            title: "New article on Bitcoin PeakDip".into(),
            body,
            icon: self.site(ICON),
            badge: self.site(BADGE),
            tag: format!("article-{}", article.id),
            require_interaction: true,
            actions: vec![
                NotificationAction {
                    action: "read".into(),
                    title: "Read now".into(),
                },
                NotificationAction {
                    action: "dismiss".into(),
                    title: "Later".into(),
                },
            ],
            data: NotificationData {
                url: self.article_url(article),
                article_ids: vec![article.id.clone()],
            },
        }
    }

    fn digest_payload(&self, articles: &[Article]) -> NotificationPayload {
        let mut body = articles
            .iter()
            .take(DIGEST_PREVIEW)
            .map(|a| format!("• {}", a.title))
            .collect::<Vec<_>>()
            .join("\n");
        if articles.len() > DIGEST_PREVIEW {
            body.push_str(&format!("\n…and {} more", articles.len() - DIGEST_PREVIEW));
        }
        NotificationPayload {
            title: format!("{} new articles on Bitcoin PeakDip", articles.len()),
            body,
            icon: self.site(ICON),
            badge: self.site(BADGE),
            tag: DIGEST_TAG.into(),
            require_interaction: true,
            actions: vec![
                NotificationAction {
                    action: "view-all".into(),
                    title: "View all".into(),
                },
                NotificationAction {
                    action: "dismiss".into(),
                    title: "Dismiss".into(),
                },
            ],
            data: NotificationData {
                url: self.list_url(),
                article_ids: articles.iter().map(|a| a.id.clone()).collect(),
            },
        }
    }

    /// Route a notification click to where the page should navigate.
    pub fn notification_click(&self, action: Option<&str>, data: &NotificationData) -> ClickTarget {
        match action {
            Some("dismiss") | Some("close") => ClickTarget::Dismiss,
            Some("view-all") => ClickTarget::List(self.list_url()),
            _ if data.url.is_empty() => ClickTarget::List(self.list_url()),
            _ => ClickTarget::Article(data.url.clone()),
        }
    }

    pub async fn status(&self) -> NotifierStatus {
        NotifierStatus {
            enabled: self.is_enabled().await,
            permission: self.caps.permission.current().await,
            notified: self.notified_ids().await.len(),
            cached_articles: self.articles.lock().await.len(),
            polling: self.poller.lock().await.is_some(),
        }
    }

    pub async fn start_polling(self: &Arc<Self>) {
        let mut guard = self.poller.lock().await;
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let every = self.config.check_interval;
        *guard = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            loop {
                ticker.tick().await;
                let outcome = this.check_for_new_articles(false).await;
                debug!(?outcome, "article poll finished");
            }
        }));
        info!(?every, "article polling started");
    }

    pub async fn stop_polling(&self) {
        let Some(handle) = self.poller.lock().await.take() else {
            return;
        };
        handle.abort();
        // Wait until an in-flight cycle has actually been dropped.
        let _ = handle.await;
        info!("article polling stopped");
    }
}

/// Stripped-down notification for the direct surface.
fn minimal(rich: &NotificationPayload, articles: &[Article]) -> NotificationPayload {
    let body = match articles {
        [one] => one.title.clone(),
        many => format!("{} new articles to read", many.len()),
    };
    NotificationPayload {
        title: rich.title.clone(),
        body,
        icon: rich.icon.clone(),
        badge: rich.badge.clone(),
        tag: rich.tag.clone(),
        require_interaction: false,
        actions: Vec::new(),
        data: rich.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(id: &str, date: &str) -> Article {
        Article {
            id: id.into(),
            title: format!("Title {id}"),
            slug: id.into(),
            date: date.into(),
            reading_time: None,
            level: None,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_includes_recent_and_excludes_old() {
        let list = vec![article("a1", "2026-02-10")];
        assert_eq!(select_new(&list, &[], day(2026, 2, 12), 7).len(), 1);
        assert!(select_new(&list, &[], day(2026, 2, 25), 7).is_empty());
    }

    #[test]
    fn window_edges() {
        let list = vec![
            article("edge", "2026-02-05"),
            article("past", "2026-02-04"),
            article("future", "2026-02-13"),
            article("bad", "someday"),
        ];
        let ids: Vec<_> = select_new(&list, &[], day(2026, 2, 12), 7)
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["edge"]);
    }

    #[test]
    fn notified_ids_are_excluded() {
        let list = vec![article("a1", "2026-02-10"), article("a2", "2026-02-11")];
        let fresh = select_new(&list, &["a1".to_string()], day(2026, 2, 12), 7);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "a2");
    }

    #[test]
    fn minimal_payload_drops_actions() {
        let rich = NotificationPayload {
            title: "t".into(),
            body: "long".into(),
            icon: "i".into(),
            badge: "b".into(),
            tag: "tag".into(),
            require_interaction: true,
            actions: vec![NotificationAction {
                action: "read".into(),
                title: "Read".into(),
            }],
            data: NotificationData::default(),
        };
        let list = vec![article("a1", "2026-02-10"), article("a2", "2026-02-10")];
        let m = minimal(&rich, &list);
        assert!(m.actions.is_empty());
        assert!(!m.require_interaction);
        assert_eq!(m.body, "2 new articles to read");
    }
}
