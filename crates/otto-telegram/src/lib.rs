//! Telegram Bot API transport.
//!
//! Implements the `MessageTransport` hook the delivery processor consumes.
//! Failures surface as `OttoError::Transport` so the queue retries them with
//! backoff; nothing here is fatal.

use async_trait::async_trait;
use otto_core::error::{OttoError, Result};
use otto_core::traits::MessageTransport;
use tracing::{debug, info};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram `sendMessage` over HTTPS.
pub struct TelegramTransport {
    client: reqwest::Client,
    bot_token: String,
}

impl TelegramTransport {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: bot_token.into(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.bot_token)
    }
}

#[async_trait]
impl MessageTransport for TelegramTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| OttoError::Transport(format!("sendMessage request: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OttoError::Transport(format!("sendMessage response: {e}")))?;

        // The Bot API envelope carries its own ok flag; HTTP status alone is
        // not enough.
        if !status.is_success() || !body["ok"].as_bool().unwrap_or(false) {
            let description = body["description"].as_str().unwrap_or("unknown error");
            return Err(OttoError::Transport(format!(
                "sendMessage failed ({status}): {description}"
            )));
        }

        debug!("Sent Telegram message to chat {chat_id}");
        Ok(())
    }
}

/// Tokenless fallback transport: logs instead of sending. Used when Telegram
/// is not configured so the delivery loop still drains the queue in dev runs.
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        info!("💬 [chat {chat_id}] {text}");
        Ok(())
    }
}
