//! Notification delivery
//!
//! This module provides:
//! - The `Notifier` trait the scheduler delivers through
//! - Per-subscriber fan-out with failure isolation
//! - Message rendering for new videos and discovered sounds
//! - The Telegram Bot API backend

mod telegram;

pub use telegram::*;

use crate::error::Result;
use crate::fetch::{sound_url, Item};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Maximum description length in a rendered message, in graphemes
pub const MAX_DESCRIPTION_GRAPHEMES: usize = 500;

/// Capability for delivering one message to one chat
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone)]
pub struct Delivery {
    pub chat_id: i64,
    pub error: Option<String>,
}

impl Delivery {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Deliver one message to every chat, independently. A failed delivery is
/// logged and captured in the result; it neither stops the remaining sends
/// nor surfaces to the caller. Outcomes come back in input order.
pub async fn notify_all(notifier: &dyn Notifier, chats: &[i64], text: &str) -> Vec<Delivery> {
    let sends = chats.iter().map(|&chat_id| async move {
        match notifier.send(chat_id, text).await {
            Ok(()) => Delivery {
                chat_id,
                error: None,
            },
            Err(e) => {
                warn!(chat_id, "Delivery failed: {}", e);
                Delivery {
                    chat_id,
                    error: Some(e.to_string()),
                }
            }
        }
    });

    join_all(sends).await
}

/// Render the notification for a new video under a tracked sound
pub fn render_video_message(music_id: &str, title: Option<&str>, item: &Item) -> String {
    format!(
        "<b>New video on sound</b> <code>{}</code>{}\n\
         <a href=\"{}\">Video</a> | {}\n\
         Author: @{}\n\
         Description: {}\n\
         Sound: {}",
        escape_html(music_id),
        title
            .map(|t| format!(" — {}", escape_html(t)))
            .unwrap_or_default(),
        item.link(),
        format_timestamp(item.created_at),
        escape_html(&item.author),
        escape_html(&truncate_graphemes(&item.description, MAX_DESCRIPTION_GRAPHEMES)),
        sound_url(music_id),
    )
}

/// Render the notification for a sound discovered under a tracked hashtag
pub fn render_sound_message(tag: &str, item: &Item) -> String {
    let title = if item.description.is_empty() {
        "—".to_string()
    } else {
        escape_html(&item.description)
    };
    format!(
        "<b>New sound under hashtag</b> #{}\n\
         <code>{}</code> — {}\n\
         {}",
        escape_html(tag),
        escape_html(&item.id),
        title,
        sound_url(&item.id),
    )
}

/// Format an epoch timestamp for display; 0 means unknown
pub fn format_timestamp(ts: i64) -> String {
    if ts == 0 {
        return "—".to_string();
    }
    match Utc.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M UTC").to_string(),
        _ => "—".to_string(),
    }
}

/// Escape text for Telegram HTML parse mode
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Truncate on grapheme boundaries so multi-byte text never gets split
fn truncate_graphemes(text: &str, max: usize) -> String {
    match text.grapheme_indices(true).nth(max) {
        Some((offset, _)) => text[..offset].to_string(),
        None => text.to_string(),
    }
}
