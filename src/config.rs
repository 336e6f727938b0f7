//! Configuration loader and validator for the offline cache and notifiers.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub worker: Worker,
    pub notifications: Notifications,
    pub updates: Updates,
    #[serde(default)]
    pub telegram: Option<Telegram>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Absolute origin of the site, e.g. `https://bitcoinpeakdip.com/`.
    pub site_url: String,
    /// Answer for interactive confirmations when running headless.
    #[serde(default)]
    pub auto_confirm: bool,
    /// Whether the host grants notification permission.
    #[serde(default = "default_true")]
    pub notifications_permitted: bool,
}

/// Cache worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub cache_prefix: String,
    pub version: String,
    pub precache: Vec<String>,
    pub live_data_path: String,
    pub cdn_hosts: Vec<String>,
    pub offline_page: String,
}

/// Article notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub metadata_url: String,
    pub check_interval_secs: u64,
    pub new_article_days: i64,
    pub cache_ttl_secs: u64,
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Version check settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Updates {
    pub version_url: String,
    pub current_version: String,
    pub check_interval_secs: u64,
}

/// Optional Telegram chat used as the rich notification surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub chat_id: i64,
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/peakdip.db", self.app.data_dir))
    }
}

impl Notifications {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Updates {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.app.site_url).is_err() {
        return Err(ConfigError::Invalid("app.site_url must be an absolute URL"));
    }

    if cfg.worker.cache_prefix.trim().is_empty() {
        return Err(ConfigError::Invalid("worker.cache_prefix must be non-empty"));
    }
    if cfg.worker.version.trim().is_empty() {
        return Err(ConfigError::Invalid("worker.version must be non-empty"));
    }
    if !cfg.worker.live_data_path.starts_with('/') {
        return Err(ConfigError::Invalid("worker.live_data_path must start with '/'"));
    }
    if !cfg.worker.offline_page.starts_with('/') {
        return Err(ConfigError::Invalid("worker.offline_page must start with '/'"));
    }

    if cfg.notifications.metadata_url.trim().is_empty() {
        return Err(ConfigError::Invalid("notifications.metadata_url must be non-empty"));
    }
    if cfg.notifications.check_interval_secs == 0 {
        return Err(ConfigError::Invalid("notifications.check_interval_secs must be > 0"));
    }
    if cfg.notifications.new_article_days < 0 {
        return Err(ConfigError::Invalid("notifications.new_article_days must be >= 0"));
    }
    if cfg.notifications.fetch_timeout_ms == 0 {
        return Err(ConfigError::Invalid("notifications.fetch_timeout_ms must be > 0"));
    }

    if cfg.updates.version_url.trim().is_empty() {
        return Err(ConfigError::Invalid("updates.version_url must be non-empty"));
    }
    if cfg.updates.current_version.parse::<crate::version::Version>().is_err() {
        return Err(ConfigError::Invalid("updates.current_version must be MAJOR.MINOR.PATCH"));
    }
    if cfg.updates.check_interval_secs == 0 {
        return Err(ConfigError::Invalid("updates.check_interval_secs must be > 0"));
    }

    if let Some(tg) = &cfg.telegram {
        if tg.bot_token.trim().is_empty() {
            return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
        }
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  site_url: "https://bitcoinpeakdip.com/"
  auto_confirm: false
  notifications_permitted: true

worker:
  cache_prefix: "peakdip-cache"
  version: "1.4.2"
  precache:
    - "/"
    - "/index.html"
    - "/offline.html"
    - "/learn/"
    - "/reading-list.html"
    - "/css/style.css"
    - "/js/main.js"
    - "/manifest.json"
  live_data_path: "/data/signals.csv"
  cdn_hosts:
    - "cdn.jsdelivr.net"
    - "cdnjs.cloudflare.com"
    - "fonts.googleapis.com"
    - "fonts.gstatic.com"
  offline_page: "/offline.html"

notifications:
  metadata_url: "/learn/data/articles.json"
  check_interval_secs: 1800
  new_article_days: 7
  cache_ttl_secs: 3600
  fetch_timeout_ms: 5000
  debounce_ms: 1000

updates:
  version_url: "/version.json"
  current_version: "1.4.2"
  check_interval_secs: 3600
"#
}
