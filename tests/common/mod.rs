#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use peakdip_offline::capabilities::{
    Capabilities, NotificationSurface, PageHost, Permission, StaticPermission, ToastLevel,
    UiFeedback, UpdateChoice,
};
use peakdip_offline::fetch::{FetchError, Fetcher};
use peakdip_offline::model::{FetchRequest, NotificationPayload, Response};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// URL without query string; routes ignore cache-busting parameters.
pub fn route_of(url: &reqwest::Url) -> String {
    let mut bare = url.clone();
    bare.set_query(None);
    bare.to_string()
}

#[derive(Clone, Default)]
pub struct RecordingFetcher {
    queued: Arc<Mutex<HashMap<String, VecDeque<Result<Response, FetchError>>>>>,
    sticky: Arc<Mutex<HashMap<String, Result<Response, FetchError>>>>,
    calls: Arc<Mutex<Vec<FetchRequest>>>,
}

impl RecordingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request for `url` with `result`.
    pub async fn set(&self, url: &str, result: Result<Response, FetchError>) {
        self.sticky.lock().await.insert(url.to_string(), result);
    }

    /// Answer the next request for `url` with `result`, before any sticky answer.
    pub async fn push(&self, url: &str, result: Result<Response, FetchError>) {
        self.queued
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    pub async fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().await.clone()
    }

    pub async fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|r| route_of(&r.url) == url)
            .count()
    }
}

#[async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Response, FetchError> {
        self.calls.lock().await.push(request.clone());
        let route = route_of(&request.url);
        if let Some(next) = self
            .queued
            .lock()
            .await
            .get_mut(&route)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        self.sticky
            .lock()
            .await
            .get(&route)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Network(format!("no route for {route}"))))
    }
}

/// Fetcher that parks every request until `open` is called, then answers
/// immediately from then on.
#[derive(Clone)]
pub struct GateFetcher {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    armed: Arc<AtomicBool>,
    body: Response,
}

impl GateFetcher {
    pub fn new(body: Response) -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            armed: Arc::new(AtomicBool::new(true)),
            body,
        }
    }

    /// Resolves once a request is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[async_trait]
impl Fetcher for GateFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<Response, FetchError> {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(self.body.clone())
    }
}

#[derive(Clone, Default)]
pub struct RecordingSurface {
    pub fail: bool,
    shown: Arc<Mutex<Vec<NotificationPayload>>>,
}

impl RecordingSurface {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn shown(&self) -> Vec<NotificationPayload> {
        self.shown.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSurface for RecordingSurface {
    async fn show(&self, payload: &NotificationPayload) -> Result<()> {
        if self.fail {
            return Err(anyhow!("surface unavailable"));
        }
        self.shown.lock().await.push(payload.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct RecordingUi {
    pub confirm_answer: bool,
    pub update_choice: UpdateChoice,
    toasts: Arc<Mutex<Vec<(String, ToastLevel)>>>,
    badges: Arc<Mutex<Vec<usize>>>,
    offers: Arc<Mutex<Vec<String>>>,
}

impl RecordingUi {
    pub fn new(confirm_answer: bool, update_choice: UpdateChoice) -> Self {
        Self {
            confirm_answer,
            update_choice,
            toasts: Default::default(),
            badges: Default::default(),
            offers: Default::default(),
        }
    }

    pub async fn toasts(&self) -> Vec<(String, ToastLevel)> {
        self.toasts.lock().await.clone()
    }

    pub async fn badges(&self) -> Vec<usize> {
        self.badges.lock().await.clone()
    }

    pub async fn offers(&self) -> Vec<String> {
        self.offers.lock().await.clone()
    }
}

impl Default for RecordingUi {
    fn default() -> Self {
        Self::new(true, UpdateChoice::Later)
    }
}

#[async_trait]
impl UiFeedback for RecordingUi {
    async fn toast(&self, message: &str, level: ToastLevel) {
        self.toasts.lock().await.push((message.to_string(), level));
    }

    async fn confirm(&self, _question: &str) -> bool {
        self.confirm_answer
    }

    async fn update_badges(&self, count: usize) {
        self.badges.lock().await.push(count);
    }

    async fn offer_update(&self, version: &str) -> UpdateChoice {
        self.offers.lock().await.push(version.to_string());
        self.update_choice
    }
}

#[derive(Clone, Default)]
pub struct RecordingHost {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingHost {
    pub async fn events(&self) -> Vec<&'static str> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl PageHost for RecordingHost {
    async fn unregister_worker(&self) -> Result<()> {
        self.events.lock().await.push("unregister");
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.events.lock().await.push("reload");
        Ok(())
    }
}

pub struct Fakes {
    pub delegated: RecordingSurface,
    pub direct: RecordingSurface,
    pub ui: RecordingUi,
    pub host: RecordingHost,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            delegated: RecordingSurface::default(),
            direct: RecordingSurface::default(),
            ui: RecordingUi::default(),
            host: RecordingHost::default(),
        }
    }

    pub fn capabilities(&self, permission: Permission) -> Capabilities {
        Capabilities {
            permission: Arc::new(StaticPermission(permission)),
            delegated: Arc::new(self.delegated.clone()),
            direct: Arc::new(self.direct.clone()),
            ui: Arc::new(self.ui.clone()),
            host: Arc::new(self.host.clone()),
        }
    }
}
