//! Telegram Bot API channel.
//!
//! Operates in long-polling mode: `getUpdates` drives the incoming side,
//! outgoing messages use `sendMessage` / `sendPhoto` (multipart upload for
//! locally staged images). Inline keyboards carry the purchase-funnel
//! actions; taps come back as callback queries and are acknowledged with
//! `answerCallbackQuery` so the client stops showing a spinner.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelEvent, ChatTransport, InlineButton, TransportError};

/// Telegram Bot API host.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Long-poll window for getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Per-request ceiling for ordinary sends.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TelegramChannel {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

/// One parsed update: its id plus the funnel event it carries, if any.
struct ParsedUpdate {
    update_id: i64,
    event: Option<ChannelEvent>,
    /// Callback query id to acknowledge.
    callback_id: Option<String>,
}

impl TelegramChannel {
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .timeout(SEND_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            // The user blocked the bot or deleted the account.
            return Err(TransportError::Unreachable);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(TransportError::Delivery(format!(
                "{method} failed ({status}): {detail}"
            )));
        }
        Ok(resp.json().await?)
    }

    /// Register the command menu shown in the client.
    pub async fn setup_commands(&self) -> Result<(), TransportError> {
        self.call(
            "setMyCommands",
            serde_json::json!({
                "commands": [
                    { "command": "start", "description": "Iniciar" },
                    { "command": "help", "description": "Ajuda" },
                ]
            }),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) {
        let result = self
            .call(
                "answerCallbackQuery",
                serde_json::json!({ "callback_query_id": callback_id }),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!("answerCallbackQuery failed: {e}");
        }
    }

    async fn poll_updates(&self, offset: i64) -> Result<Vec<serde_json::Value>, TransportError> {
        let resp = self
            .client
            .post(self.api_url("getUpdates"))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 5))
            .json(&serde_json::json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(TransportError::Delivery(format!(
                "getUpdates failed ({status})"
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        Ok(body
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Long-poll loop: turns Telegram updates into [`ChannelEvent`]s until
    /// the receiver side goes away.
    pub async fn listen(&self, tx: mpsc::Sender<ChannelEvent>) -> anyhow::Result<()> {
        if let Err(e) = self.setup_commands().await {
            tracing::warn!("could not register command menu: {e}");
        }
        tracing::info!("telegram: long-polling for updates");

        let mut offset: i64 = 0;
        loop {
            let updates = match self.poll_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!("telegram: poll failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                let parsed = parse_update(&update);
                offset = offset.max(parsed.update_id + 1);
                if let Some(callback_id) = parsed.callback_id.as_deref() {
                    self.answer_callback(callback_id).await;
                }
                if let Some(event) = parsed.event {
                    if tx.send(event).await.is_err() {
                        anyhow::bail!("telegram: event receiver dropped");
                    }
                }
            }
        }
    }
}

/// Extract the funnel event from one `getUpdates` entry.
fn parse_update(update: &serde_json::Value) -> ParsedUpdate {
    let update_id = update.get("update_id").and_then(|v| v.as_i64()).unwrap_or(0);

    // Slash command in a message
    if let Some(message) = update.get("message") {
        let text = message.get("text").and_then(|t| t.as_str()).unwrap_or("");
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(|id| id.as_i64());
        if let (Some(chat_id), Some(stripped)) = (chat_id, text.strip_prefix('/')) {
            // "/start@SomeBot arg" -> "start"
            let command = stripped
                .split_whitespace()
                .next()
                .unwrap_or("")
                .split('@')
                .next()
                .unwrap_or("")
                .to_lowercase();
            if !command.is_empty() {
                let from = message.get("from");
                return ParsedUpdate {
                    update_id,
                    event: Some(ChannelEvent::Command {
                        user_key: chat_id.to_string(),
                        username: json_str(from, "username"),
                        first_name: json_str(from, "first_name"),
                        command,
                    }),
                    callback_id: None,
                };
            }
        }
        return ParsedUpdate {
            update_id,
            event: None,
            callback_id: None,
        };
    }

    // Inline button tap
    if let Some(callback) = update.get("callback_query") {
        let callback_id = callback
            .get("id")
            .and_then(|id| id.as_str())
            .map(String::from);
        let from = callback.get("from");
        let user_id = from
            .and_then(|f| f.get("id"))
            .and_then(|id| id.as_i64());
        let action = callback
            .get("data")
            .and_then(|d| d.as_str())
            .unwrap_or("");
        if let Some(user_id) = user_id {
            if !action.is_empty() {
                return ParsedUpdate {
                    update_id,
                    event: Some(ChannelEvent::Action {
                        user_key: user_id.to_string(),
                        username: json_str(from, "username"),
                        first_name: json_str(from, "first_name"),
                        action: action.to_string(),
                    }),
                    callback_id,
                };
            }
        }
        return ParsedUpdate {
            update_id,
            event: None,
            callback_id,
        };
    }

    ParsedUpdate {
        update_id,
        event: None,
        callback_id: None,
    }
}

fn json_str(value: Option<&serde_json::Value>, key: &str) -> Option<String> {
    value
        .and_then(|v| v.get(key))
        .and_then(|s| s.as_str())
        .map(String::from)
}

/// `reply_markup` payload: one button per row, as the funnel always offers a
/// single primary action.
fn inline_keyboard(buttons: &[InlineButton]) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = buttons
        .iter()
        .map(|b| {
            serde_json::json!([{
                "text": b.label,
                "callback_data": b.action,
            }])
        })
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

#[async_trait]
impl ChatTransport for TelegramChannel {
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), TransportError> {
        self.call(
            "sendMessage",
            serde_json::json!({
                "chat_id": recipient,
                "text": text,
            }),
        )
        .await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        recipient: &str,
        image: &Path,
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| TransportError::Delivery(format!("could not read staged image: {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", recipient.to_string())
            .part(
                "photo",
                reqwest::multipart::Part::bytes(bytes).file_name("qrcode.png"),
            );
        if let Some(caption) = caption {
            form = form
                .text("caption", caption.to_string())
                .text("parse_mode", "MarkdownV2");
        }

        let resp = self
            .client
            .post(self.api_url("sendPhoto"))
            .timeout(SEND_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Unreachable);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(TransportError::Delivery(format!(
                "sendPhoto failed ({status}): {detail}"
            )));
        }
        Ok(())
    }

    async fn send_choices(
        &self,
        recipient: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), TransportError> {
        self.call(
            "sendMessage",
            serde_json::json!({
                "chat_id": recipient,
                "text": text,
                "reply_markup": inline_keyboard(buttons),
            }),
        )
        .await?;
        Ok(())
    }
}
