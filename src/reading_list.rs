//! Saved-for-later articles, stored in durable client storage.
//!
//! Every operation re-reads the stored list so changes made by other pages
//! are picked up; mutations refresh the badges and are announced to the
//! other pages over a broadcast channel.

use crate::capabilities::{ToastLevel, UiFeedback};
use crate::clock::Clock;
use crate::model::ReadingListItem;
use crate::storage::{self, keys, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadingListError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid import data: {0}")]
    InvalidImport(String),
    #[error("storage error: {0}")]
    Storage(String),
}

type Result<T> = std::result::Result<T, ReadingListError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewItem {
    pub id: String,
    pub title: String,
    pub url: String,
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadySaved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadingListEvent {
    Added(String),
    Removed(Vec<String>),
    Cleared,
    Imported { added: usize, replaced: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub replaced: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportEnvelope<T> {
    version: u32,
    exported_at: DateTime<Utc>,
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportedItem {
    id: String,
    title: String,
    url: String,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    published_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportDoc {
    Envelope(ExportEnvelope<ImportedItem>),
    Bare(Vec<ImportedItem>),
}

fn validate(item: &NewItem) -> Result<()> {
    if item.id.trim().is_empty() {
        return Err(ReadingListError::MissingField("id"));
    }
    if item.title.trim().is_empty() {
        return Err(ReadingListError::MissingField("title"));
    }
    if item.url.trim().is_empty() {
        return Err(ReadingListError::MissingField("url"));
    }
    Ok(())
}

/// Channel shared by every page so reading-list changes reach the others.
pub fn channel() -> broadcast::Sender<ReadingListEvent> {
    broadcast::channel(64).0
}

pub struct ReadingList {
    store: Arc<dyn KeyValueStore>,
    ui: Arc<dyn UiFeedback>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<ReadingListEvent>,
}

impl ReadingList {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        ui: Arc<dyn UiFeedback>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<ReadingListEvent>,
    ) -> Self {
        Self {
            store,
            ui,
            clock,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReadingListEvent> {
        self.events.subscribe()
    }

    /// Current items; unreadable storage counts as an empty list.
    pub async fn items(&self) -> Vec<ReadingListItem> {
        storage::read_json(self.store.as_ref(), keys::READING_LIST)
            .await
            .unwrap_or_default()
    }

    async fn save(&self, items: &[ReadingListItem], event: ReadingListEvent) -> Result<()> {
        storage::write_json(self.store.as_ref(), keys::READING_LIST, items)
            .await
            .map_err(|e| ReadingListError::Storage(e.to_string()))?;
        self.ui.update_badges(items.len()).await;
        // No receivers just means no other page is open.
        let _ = self.events.send(event);
        Ok(())
    }

    #[instrument(skip_all, fields(id = %item.id))]
    pub async fn add(&self, item: NewItem) -> Result<AddOutcome> {
        if let Err(err) = validate(&item) {
            self.ui
                .toast("Could not save this article.", ToastLevel::Error)
                .await;
            return Err(err);
        }

        let mut items = self.items().await;
        if items.iter().any(|i| i.id == item.id) {
            debug!("already in reading list");
            self.ui
                .toast("Already in your reading list.", ToastLevel::Info)
                .await;
            return Ok(AddOutcome::AlreadySaved);
        }
        let id = item.id.clone();
        items.push(ReadingListItem {
            id: item.id,
            title: item.title,
            url: item.url,
            saved_at: self.clock.now(),
            published_date: item.published_date,
        });
        self.save(&items, ReadingListEvent::Added(id)).await?;
        self.ui
            .toast("Saved to your reading list.", ToastLevel::Success)
            .await;
        info!(count = items.len(), "saved to reading list");
        Ok(AddOutcome::Added)
    }

    /// Returns whether the item was present.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.remove_multiple(&[id]).await? == 1)
    }

    pub async fn remove_multiple(&self, ids: &[&str]) -> Result<usize> {
        let (gone, kept): (Vec<_>, Vec<_>) = self
            .items()
            .await
            .into_iter()
            .partition(|i| ids.contains(&i.id.as_str()));
        if gone.is_empty() {
            return Ok(0);
        }
        let removed: Vec<String> = gone.into_iter().map(|i| i.id).collect();
        let count = removed.len();
        self.save(&kept, ReadingListEvent::Removed(removed)).await?;
        Ok(count)
    }

    /// Empty the list after the user confirms. Returns whether it was cleared.
    pub async fn clear_all(&self) -> Result<bool> {
        if !self
            .ui
            .confirm("Remove all articles from your reading list?")
            .await
        {
            return Ok(false);
        }
        self.save(&[], ReadingListEvent::Cleared).await?;
        info!("reading list cleared");
        Ok(true)
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.items().await.iter().any(|i| i.id == id)
    }

    pub async fn count(&self) -> usize {
        self.items().await.len()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<ReadingListItem> {
        self.items().await.into_iter().find(|i| i.id == id)
    }

    /// Case-insensitive substring match on the title.
    pub async fn search(&self, query: &str) -> Vec<ReadingListItem> {
        let needle = query.trim().to_lowercase();
        self.items()
            .await
            .into_iter()
            .filter(|i| i.title.to_lowercase().contains(&needle))
            .collect()
    }

    /// Items ordered by the time they were saved.
    pub async fn sort_by_date(&self, newest_first: bool) -> Vec<ReadingListItem> {
        let mut items = self.items().await;
        items.sort_by_key(|i| i.saved_at);
        if newest_first {
            items.reverse();
        }
        items
    }

    pub async fn export(&self) -> Result<String> {
        let envelope = ExportEnvelope {
            version: EXPORT_FORMAT_VERSION,
            exported_at: self.clock.now(),
            items: self.items().await,
        };
        serde_json::to_string_pretty(&envelope).map_err(|e| ReadingListError::Storage(e.to_string()))
    }

    /// Merge exported data into the list. Imported entries replace local
    /// entries with the same id; the rest are appended.
    #[instrument(skip_all)]
    pub async fn import(&self, text: &str) -> Result<ImportSummary> {
        let doc: ImportDoc =
            serde_json::from_str(text).map_err(|e| ReadingListError::InvalidImport(e.to_string()))?;
        let incoming = match doc {
            ImportDoc::Envelope(env) => env.items,
            ImportDoc::Bare(items) => items,
        };
        if let Some(bad) = incoming
            .iter()
            .find(|i| i.id.trim().is_empty() || i.url.trim().is_empty())
        {
            return Err(ReadingListError::InvalidImport(format!(
                "entry {:?} lacks an id or url",
                bad.title
            )));
        }

        let now = self.clock.now();
        let mut items = self.items().await;
        let mut summary = ImportSummary {
            added: 0,
            replaced: 0,
        };
        for imported in incoming {
            let item = ReadingListItem {
                saved_at: imported.saved_at.unwrap_or(now),
                id: imported.id,
                title: imported.title,
                url: imported.url,
                published_date: imported.published_date,
            };
            match items.iter_mut().find(|i| i.id == item.id) {
                Some(slot) => {
                    *slot = item;
                    summary.replaced += 1;
                }
                None => {
                    items.push(item);
                    summary.added += 1;
                }
            }
        }
        self.save(
            &items,
            ReadingListEvent::Imported {
                added: summary.added,
                replaced: summary.replaced,
            },
        )
        .await?;
        info!(added = summary.added, replaced = summary.replaced, "reading list imported");
        Ok(summary)
    }
}
