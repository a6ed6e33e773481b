//! Scrape-based fetch adapter over the platform's public pages
//!
//! Music and tag pages embed their render state as JSON in a
//! `script#SIGI_STATE` element. The adapter pulls the page, extracts that
//! state, and walks it into an item batch. No other markup is relied on.

use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::fetch::{FetchAdapter, FetchedBatch, GlobalRateLimiter, Item};
use crate::store::TargetType;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Extract a music id from user input: either a raw numeric id or a
/// `tiktok.com/music/...-<id>` page URL.
pub fn music_id_from_input(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }

    let re = Regex::new(r"https?://(?:www\.)?tiktok\.com/music/[^/]*-(\d+)").ok()?;
    re.captures(trimmed).map(|captures| captures[1].to_string())
}

/// Fetch adapter that scrapes public music and tag pages
pub struct PageFetcher {
    client: Client,
    base_url: String,
    fetch_limit: usize,
    rate: GlobalRateLimiter,
}

impl PageFetcher {
    /// Create a new page fetcher
    pub fn new(config: &FetchConfig, fetch_limit: usize) -> Result<Self> {
        url::Url::parse(&config.base_url)?;

        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Fetch(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fetch_limit,
            rate: GlobalRateLimiter::new(config.rate_limit_per_sec),
        })
    }

    async fn fetch_page(&self, path: &str) -> Result<String> {
        self.rate.wait().await;

        let url = format!("{}{}", self.base_url, path);
        debug!("Fetching: {}", url);

        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {}: {}", status, url)));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl FetchAdapter for PageFetcher {
    async fn fetch(&self, target_type: TargetType, target_id: &str) -> Result<FetchedBatch> {
        match target_type {
            TargetType::Sound => {
                let html = self.fetch_page(&format!("/music/_-{}", target_id)).await?;
                let state = extract_embedded_state(&html)?;
                Ok(FetchedBatch {
                    items: video_items_from_state(&state, self.fetch_limit),
                    remote_title: music_title_from_state(&state),
                })
            }
            TargetType::Hashtag => {
                let html = self.fetch_page(&format!("/tag/{}", target_id)).await?;
                let state = extract_embedded_state(&html)?;
                Ok(FetchedBatch {
                    items: sound_items_from_state(&state, self.fetch_limit),
                    remote_title: None,
                })
            }
        }
    }
}

/// Pull the embedded `SIGI_STATE` JSON out of a page
fn extract_embedded_state(html: &str) -> Result<Value> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("script#SIGI_STATE")
        .map_err(|_| Error::Parse("Invalid embedded-state selector".to_string()))?;

    let raw = match document.select(&selector).next() {
        Some(element) => element.text().collect::<String>(),
        None => {
            // Markup too broken for the HTML parser to pair the element up;
            // fall back to a raw scan before declaring the page stateless.
            let re = Regex::new(r#"(?s)<script id="SIGI_STATE"[^>]*>(.*?)</script>"#)
                .map_err(|e| Error::Parse(e.to_string()))?;
            match re.captures(html) {
                Some(captures) => captures[1].to_string(),
                None => {
                    return Err(Error::Parse(
                        "No embedded SIGI_STATE script in page".to_string(),
                    ))
                }
            }
        }
    };

    serde_json::from_str(&raw)
        .map_err(|e| Error::Parse(format!("Embedded state is not valid JSON: {}", e)))
}

/// Video items for a sound target, newest first
fn video_items_from_state(state: &Value, limit: usize) -> Vec<Item> {
    let mut items = Vec::new();

    if let Some(module) = state.get("ItemModule").and_then(Value::as_object) {
        for (video_id, data) in module {
            if video_id.is_empty() {
                warn!("Dropping item without id");
                continue;
            }
            items.push(Item {
                id: video_id.clone(),
                created_at: value_as_i64(data.get("createTime")),
                author: data
                    .get("author")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim_matches('@')
                    .to_string(),
                description: data
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                cover: data
                    .get("video")
                    .and_then(|v| v.get("cover"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            });
        }
    }

    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    items.truncate(limit);
    items
}

/// Sounds discovered on a tag page, one item per distinct music id. Tag pages
/// expose no per-sound timestamps, so `created_at` stays 0 and dedup runs on
/// ids alone downstream.
fn sound_items_from_state(state: &Value, limit: usize) -> Vec<Item> {
    let mut items: Vec<Item> = Vec::new();

    if let Some(module) = state.get("ItemModule").and_then(Value::as_object) {
        for data in module.values() {
            let Some(music) = data.get("music") else {
                continue;
            };
            let music_id = match music.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    warn!("Dropping discovered sound without id");
                    continue;
                }
            };
            if items.iter().any(|item| item.id == music_id) {
                continue;
            }
            items.push(Item {
                id: music_id,
                created_at: 0,
                author: music
                    .get("authorName")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                description: music
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                cover: None,
            });
        }
    }

    items.truncate(limit);
    items
}

/// Title of the music page, when present
fn music_title_from_state(state: &Value) -> Option<String> {
    let candidates = [
        &["MusicModule", "musicInfo", "music", "title"][..],
        &["MusicModule", "music", "title"][..],
        &["MusicInfo", "music", "title"][..],
    ];

    for path in candidates {
        let mut node = state;
        let mut found = true;
        for key in path {
            match node.get(key) {
                Some(next) => node = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(title) = node.as_str().filter(|t| !t.is_empty()) {
                return Some(title.to_string());
            }
        }
    }
    None
}

fn value_as_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn music_page_html() -> String {
        let state = serde_json::json!({
            "ItemModule": {
                "111": {
                    "createTime": "1700000100",
                    "author": "@alice",
                    "desc": "first video",
                    "video": {"cover": "https://cdn.example/1.jpg"},
                    "music": {"id": "555", "title": "Song A", "authorName": "A"}
                },
                "222": {
                    "createTime": 1700000200,
                    "author": "bob",
                    "desc": "second video",
                    "video": {},
                    "music": {"id": "555", "title": "Song A", "authorName": "A"}
                },
                "": {
                    "createTime": 1700000300,
                    "author": "mallory",
                    "desc": "no id"
                }
            },
            "MusicModule": {"musicInfo": {"music": {"title": "Song A"}}}
        });
        format!(
            "<html><head><script id=\"SIGI_STATE\" type=\"application/json\">{}</script></head><body></body></html>",
            state
        )
    }

    #[test]
    fn test_music_id_from_input() {
        assert_eq!(music_id_from_input("7016547803243022337"), Some("7016547803243022337".to_string()));
        assert_eq!(
            music_id_from_input("https://www.tiktok.com/music/original-sound-7016547803243022337"),
            Some("7016547803243022337".to_string())
        );
        assert_eq!(
            music_id_from_input("  https://tiktok.com/music/some-name-42  "),
            Some("42".to_string())
        );
        assert_eq!(music_id_from_input("not an id"), None);
        assert_eq!(music_id_from_input(""), None);
    }

    #[test]
    fn test_extract_embedded_state() {
        let state = extract_embedded_state(&music_page_html()).unwrap();
        assert!(state.get("ItemModule").is_some());
    }

    #[test]
    fn test_extract_embedded_state_missing_script() {
        let err = extract_embedded_state("<html><body>nothing here</body></html>")
            .expect_err("page without state should fail");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_extract_embedded_state_malformed_json() {
        let html = "<html><script id=\"SIGI_STATE\">{not json</script></html>";
        let err = extract_embedded_state(html).expect_err("bad JSON should fail");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_video_items_newest_first_and_id_drop() {
        let state = extract_embedded_state(&music_page_html()).unwrap();
        let items = video_items_from_state(&state, 50);

        // The empty-id entry is dropped; remaining items come newest first
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "222");
        assert_eq!(items[0].created_at, 1700000200);
        assert_eq!(items[0].author, "bob");
        assert_eq!(items[1].id, "111");
        assert_eq!(items[1].author, "alice");
        assert_eq!(items[1].cover.as_deref(), Some("https://cdn.example/1.jpg"));
    }

    #[test]
    fn test_video_items_respect_limit() {
        let state = extract_embedded_state(&music_page_html()).unwrap();
        let items = video_items_from_state(&state, 1);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "222");
    }

    #[test]
    fn test_sound_items_deduped_with_zero_timestamps() {
        let state = extract_embedded_state(&music_page_html()).unwrap();
        let items = sound_items_from_state(&state, 50);

        // Both videos carry the same music id; one discovered sound results
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "555");
        assert_eq!(items[0].created_at, 0);
        assert_eq!(items[0].description, "Song A");
    }

    #[test]
    fn test_music_title_from_state() {
        let state = extract_embedded_state(&music_page_html()).unwrap();
        assert_eq!(music_title_from_state(&state), Some("Song A".to_string()));

        let bare = serde_json::json!({"ItemModule": {}});
        assert_eq!(music_title_from_state(&bare), None);
    }

    fn test_fetch_config(base_url: String) -> FetchConfig {
        FetchConfig {
            base_url,
            http_proxy: None,
            user_agent: "soundwatch-test".to_string(),
            timeout_secs: 5,
            rate_limit_per_sec: 100,
        }
    }

    #[tokio::test]
    async fn test_fetch_sound_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/music/_-555"))
            .respond_with(ResponseTemplate::new(200).set_body_string(music_page_html()))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_fetch_config(server.uri()), 50).unwrap();
        let batch = fetcher.fetch(TargetType::Sound, "555").await.unwrap();

        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.remote_title, Some("Song A".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_tag_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tag/fyp"))
            .respond_with(ResponseTemplate::new(200).set_body_string(music_page_html()))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_fetch_config(server.uri()), 50).unwrap();
        let batch = fetcher.fetch(TargetType::Hashtag, "fyp").await.unwrap();

        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].id, "555");
        assert!(batch.remote_title.is_none());
    }

    #[tokio::test]
    async fn test_fetch_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/music/_-555"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&test_fetch_config(server.uri()), 50).unwrap();
        let err = fetcher
            .fetch(TargetType::Sound, "555")
            .await
            .expect_err("server error should fail the fetch");
        assert!(matches!(err, Error::Fetch(_)));
    }
}
