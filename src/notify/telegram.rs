//! Telegram Bot API backend
//!
//! Thin client over `sendMessage` and `getUpdates`. The scheduler only sees
//! the `Notifier` capability; raw updates stay inside the command loop.

use crate::config::TelegramConfig;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Telegram Bot API client
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    token: String,
}

/// Envelope every Bot API response arrives in
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

/// One incoming update
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

/// An incoming chat message
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub text: Option<String>,
    pub chat: Chat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl TelegramNotifier {
    /// Create a new client; the token comes from the configured environment
    /// variable
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config.token()?;
        Self::with_token(config, token)
    }

    /// Create a new client with an explicit token
    pub fn with_token(config: &TelegramConfig, token: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Delivery(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    /// Long-poll for incoming updates. `offset` is one past the last update
    /// already handled.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs + 10))
            .json(&json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }))
            .send()
            .await?;

        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("Malformed getUpdates response: {}", e)))?;

        if !body.ok {
            return Err(Error::Delivery(format!(
                "getUpdates failed: {}",
                body.description.unwrap_or_default()
            )));
        }

        Ok(body.result.unwrap_or_default())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        let status = response.status();
        let body: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("Malformed sendMessage response: {}", e)))?;

        if !body.ok {
            return Err(Error::Delivery(format!(
                "sendMessage to {} failed ({}): {}",
                chat_id,
                status,
                body.description.unwrap_or_default()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_url: String) -> TelegramConfig {
        TelegramConfig {
            token_env: "UNUSED".to_string(),
            api_url,
            admin_chat_id: None,
        }
    }

    async fn test_notifier(server: &MockServer) -> TelegramNotifier {
        TelegramNotifier::with_token(&test_config(server.uri()), "TOKEN".to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_send_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({"chat_id": 42, "parse_mode": "HTML"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true, "result": {"message_id": 1}})),
            )
            .mount(&server)
            .await;

        let notifier = test_notifier(&server).await;
        notifier.send(42, "hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_api_error_surfaces_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "ok": false,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&server)
            .await;

        let notifier = test_notifier(&server).await;
        let err = notifier.send(42, "hello").await.expect_err("blocked chat");
        match err {
            Error::Delivery(message) => assert!(message.contains("blocked by the user")),
            other => panic!("expected delivery error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_updates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [{
                    "update_id": 7,
                    "message": {"text": "/list", "chat": {"id": 42}}
                }]
            })))
            .mount(&server)
            .await;

        let notifier = test_notifier(&server).await;
        let updates = notifier.get_updates(0, 1).await.unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_id, 7);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 42);
        assert_eq!(message.text.as_deref(), Some("/list"));
    }
}
