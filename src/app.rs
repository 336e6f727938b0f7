//! Wiring of the production services from a loaded configuration.

use crate::articles::{ArticleNotifier, ArticleNotifierConfig};
use crate::cache::{CacheStorage, SqliteCacheStorage};
use crate::capabilities::{
    Capabilities, ConsoleUi, LogSurface, NotificationSurface, Permission, StaticPermission,
    Unsupported,
};
use crate::clients::ClientRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::reading_list::{self, ReadingList};
use crate::storage::{KeyValueStore, SqliteStore};
use crate::telegram::TelegramSurface;
use crate::version::{UpdateNotifier, UpdateNotifierConfig};
use crate::worker::{CacheWorker, WorkerConfig};
use anyhow::{Context, Result};
use reqwest::Url;
use std::sync::Arc;
use tracing::info;

pub struct Services {
    pub config: Config,
    pub pool: db::Pool,
    pub store: Arc<dyn KeyValueStore>,
    pub caches: Arc<dyn CacheStorage>,
    pub clients: Arc<ClientRegistry>,
    pub worker: Arc<CacheWorker>,
    pub articles: Arc<ArticleNotifier>,
    pub updates: Arc<UpdateNotifier>,
    pub reading_list: ReadingList,
}

/// Host capabilities for a headless run: Telegram (when configured) as the
/// rich surface, the log as the direct one.
pub fn capabilities(cfg: &Config) -> Capabilities {
    let permission = if cfg.app.notifications_permitted {
        Permission::Granted
    } else {
        Permission::Denied
    };
    let delegated: Arc<dyn NotificationSurface> = match &cfg.telegram {
        Some(tg) => Arc::new(TelegramSurface::from_config(tg)),
        None => Arc::new(Unsupported),
    };
    Capabilities {
        permission: Arc::new(StaticPermission(permission)),
        delegated,
        direct: Arc::new(LogSurface),
        ui: Arc::new(ConsoleUi {
            auto_confirm: cfg.app.auto_confirm,
        }),
        host: Arc::new(Unsupported),
    }
}

pub async fn build(cfg: Config) -> Result<Services> {
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::new(pool.clone()));
    let caches: Arc<dyn CacheStorage> = Arc::new(SqliteCacheStorage::new(pool.clone()));
    let network: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new()?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let clients = Arc::new(ClientRegistry::new(clock.clone()));
    let caps = capabilities(&cfg);

    let worker = Arc::new(CacheWorker::new(
        WorkerConfig::from_config(&cfg)?,
        caches.clone(),
        network.clone(),
        clients.clone(),
    ));

    let articles = Arc::new(ArticleNotifier::new(
        ArticleNotifierConfig::from_config(&cfg)?,
        network.clone(),
        store.clone(),
        caps.clone(),
        clock.clone(),
    ));

    let site = Url::parse(&cfg.app.site_url).context("invalid app.site_url")?;
    let updates = Arc::new(UpdateNotifier::new(
        UpdateNotifierConfig {
            version_url: site
                .join(&cfg.updates.version_url)
                .context("invalid updates.version_url")?,
            current: cfg.updates.current_version.parse()?,
            check_interval: cfg.updates.check_interval(),
            fetch_timeout: cfg.notifications.fetch_timeout(),
        },
        network,
        store.clone(),
        caches.clone(),
        caps.clone(),
        clock.clone(),
    ));

    let reading_list = ReadingList::new(store.clone(), caps.ui.clone(), clock, reading_list::channel());

    info!(generation = %worker.generation_name(), "services ready");
    Ok(Services {
        config: cfg,
        pool,
        store,
        caches,
        clients,
        worker,
        articles,
        updates,
        reading_list,
    })
}
