use crate::capabilities::NotificationSurface;
use crate::config;
use crate::model::NotificationPayload;
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{info, instrument};

/// Delivers rich notifications to a Telegram chat.
#[derive(Clone)]
pub struct TelegramSurface {
    bot: Bot,
    chat: ChatId,
}

impl TelegramSurface {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat: ChatId(chat_id),
        }
    }

    pub fn from_config(cfg: &config::Telegram) -> Self {
        Self::new(&cfg.bot_token, cfg.chat_id)
    }
}

/// Plain-text rendering: title, body, then one line per action.
pub fn render(payload: &NotificationPayload) -> String {
    let mut out = format!("{}\n\n{}", payload.title, payload.body);
    if !payload.data.url.is_empty() {
        out.push_str("\n\n");
        out.push_str(&payload.data.url);
    }
    for action in &payload.actions {
        out.push_str(&format!("\n• {} ({})", action.title, action.action));
    }
    out
}

#[async_trait]
impl NotificationSurface for TelegramSurface {
    #[instrument(skip_all, fields(tag = %payload.tag))]
    async fn show(&self, payload: &NotificationPayload) -> Result<()> {
        self.bot.send_message(self.chat, render(payload)).await?;
        info!(chat = self.chat.0, "notification sent to telegram");
        Ok(())
    }
}
