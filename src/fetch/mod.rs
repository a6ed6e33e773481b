//! Remote page fetching
//!
//! This module provides:
//! - The `FetchAdapter` trait the scheduler polls through
//! - The ephemeral `Item` batch types
//! - A scrape-based adapter over the platform's public pages
//! - Outbound rate limiting

mod music_page;
mod rate_limit;

pub use music_page::*;
pub use rate_limit::*;

use crate::error::Result;
use crate::store::TargetType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Build the public URL of a video
pub fn video_url(author: &str, video_id: &str) -> String {
    format!("https://www.tiktok.com/@{}/video/{}", author, video_id)
}

/// Build the public URL of a sound (music) page
pub fn sound_url(music_id: &str) -> String {
    format!("https://www.tiktok.com/music/_-{}", music_id)
}

/// One remote item observed for a target. For sound targets this is a video;
/// for hashtag targets it is a discovered sound. Items are never persisted in
/// full; only ids and timestamps feed the dedup state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Opaque id, unique within the target's remote namespace
    pub id: String,
    /// Seconds since epoch; 0 when the remote reports none
    pub created_at: i64,
    pub author: String,
    pub description: String,
    pub cover: Option<String>,
}

impl Item {
    /// Public URL of a video item
    pub fn link(&self) -> String {
        video_url(&self.author, &self.id)
    }
}

/// Result of one fetch: the currently visible items plus any freshness
/// metadata the page carried
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub items: Vec<Item>,
    pub remote_title: Option<String>,
}

/// Capability the scheduler polls targets through. An empty item list is a
/// valid result, distinct from failure.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    async fn fetch(&self, target_type: TargetType, target_id: &str) -> Result<FetchedBatch>;
}
