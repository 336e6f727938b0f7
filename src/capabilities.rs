//! Host capabilities injected into the page-side managers.
//!
//! Environments without a capability get [`Unsupported`], so business logic
//! never checks for availability itself.

use crate::model::NotificationPayload;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateChoice {
    UpdateNow,
    Later,
}

#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn current(&self) -> Permission;
    async fn request(&self) -> Permission;
}

#[async_trait]
pub trait NotificationSurface: Send + Sync {
    async fn show(&self, payload: &NotificationPayload) -> Result<()>;
}

/// Visible page chrome: toasts, confirm dialogs, badges, the update banner.
#[async_trait]
pub trait UiFeedback: Send + Sync {
    async fn toast(&self, message: &str, level: ToastLevel);
    async fn confirm(&self, question: &str) -> bool;
    async fn update_badges(&self, count: usize);
    async fn offer_update(&self, version: &str) -> UpdateChoice;
}

#[async_trait]
pub trait PageHost: Send + Sync {
    async fn unregister_worker(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

/// Stand-in for every capability on hosts that lack it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

#[async_trait]
impl PermissionProvider for Unsupported {
    async fn current(&self) -> Permission {
        Permission::Denied
    }

    async fn request(&self) -> Permission {
        Permission::Denied
    }
}

#[async_trait]
impl NotificationSurface for Unsupported {
    async fn show(&self, _payload: &NotificationPayload) -> Result<()> {
        Err(anyhow!("notifications are not supported on this host"))
    }
}

#[async_trait]
impl UiFeedback for Unsupported {
    async fn toast(&self, _message: &str, _level: ToastLevel) {}

    async fn confirm(&self, _question: &str) -> bool {
        false
    }

    async fn update_badges(&self, _count: usize) {}

    async fn offer_update(&self, _version: &str) -> UpdateChoice {
        UpdateChoice::Later
    }
}

#[async_trait]
impl PageHost for Unsupported {
    async fn unregister_worker(&self) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }
}

/// Permission fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermission(pub Permission);

#[async_trait]
impl PermissionProvider for StaticPermission {
    async fn current(&self) -> Permission {
        self.0
    }

    async fn request(&self) -> Permission {
        self.0
    }
}

/// Minimal notification written to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSurface;

#[async_trait]
impl NotificationSurface for LogSurface {
    async fn show(&self, payload: &NotificationPayload) -> Result<()> {
        info!(title = %payload.title, tag = %payload.tag, "{}", payload.body);
        Ok(())
    }
}

/// Headless UI: toasts go to the log, confirmations use a fixed answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleUi {
    pub auto_confirm: bool,
}

#[async_trait]
impl UiFeedback for ConsoleUi {
    async fn toast(&self, message: &str, level: ToastLevel) {
        match level {
            ToastLevel::Warning | ToastLevel::Error => warn!(?level, "{message}"),
            _ => info!(?level, "{message}"),
        }
    }

    async fn confirm(&self, question: &str) -> bool {
        info!(answer = self.auto_confirm, "{question}");
        self.auto_confirm
    }

    async fn update_badges(&self, count: usize) {
        info!(count, "reading list badge");
    }

    async fn offer_update(&self, version: &str) -> UpdateChoice {
        info!(version, "update available");
        UpdateChoice::Later
    }
}

/// Everything a page-side manager may need from the host.
#[derive(Clone)]
pub struct Capabilities {
    pub permission: Arc<dyn PermissionProvider>,
    /// Rich notification shown through the worker registration.
    pub delegated: Arc<dyn NotificationSurface>,
    /// Minimal notification used when delegation fails.
    pub direct: Arc<dyn NotificationSurface>,
    pub ui: Arc<dyn UiFeedback>,
    pub host: Arc<dyn PageHost>,
}

impl Capabilities {
    pub fn unsupported() -> Self {
        Self {
            permission: Arc::new(Unsupported),
            delegated: Arc::new(Unsupported),
            direct: Arc::new(Unsupported),
            ui: Arc::new(Unsupported),
            host: Arc::new(Unsupported),
        }
    }
}
