//! Chat transport abstraction.
//!
//! The checkout core is transport-agnostic: everything user-visible goes
//! through [`ChatTransport`], and incoming activity arrives as
//! [`ChannelEvent`]s over an mpsc channel. The Telegram implementation lives
//! in [`telegram`].

pub mod telegram;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use telegram::TelegramChannel;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The recipient cannot receive messages (blocked the bot, deleted the
    /// account). Terminal for this delivery; never retried.
    #[error("recipient is unreachable")]
    Unreachable,
    /// Any other delivery failure.
    #[error("message delivery failed: {0}")]
    Delivery(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Delivery(err.to_string())
    }
}

/// An inline choice presented under a message; `action` is echoed back as a
/// [`ChannelEvent::Action`] when the buyer taps it.
#[derive(Debug, Clone)]
pub struct InlineButton {
    pub label: String,
    pub action: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

/// Incoming chat activity relevant to the purchase funnel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A slash command ("start", "help" — without the slash).
    Command {
        user_key: String,
        username: Option<String>,
        first_name: Option<String>,
        command: String,
    },
    /// The buyer tapped an inline button.
    Action {
        user_key: String,
        username: Option<String>,
        first_name: Option<String>,
        action: String,
    },
}

impl ChannelEvent {
    pub fn user_key(&self) -> &str {
        match self {
            Self::Command { user_key, .. } | Self::Action { user_key, .. } => user_key,
        }
    }

    /// Best display name available for the sender.
    pub fn display_name(&self) -> &str {
        let (username, first_name) = match self {
            Self::Command {
                username,
                first_name,
                ..
            }
            | Self::Action {
                username,
                first_name,
                ..
            } => (username, first_name),
        };
        username
            .as_deref()
            .or(first_name.as_deref())
            .unwrap_or("cliente")
    }
}

/// Outgoing side of the chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Deliver a plain text message.
    async fn send_text(&self, recipient: &str, text: &str) -> Result<(), TransportError>;

    /// Deliver an image from a local path. When `caption` is set it is sent
    /// as a MarkdownV2 caption and must already be escaped.
    async fn send_photo(
        &self,
        recipient: &str,
        image: &Path,
        caption: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Deliver a text message with inline choices underneath.
    async fn send_choices(
        &self,
        recipient: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), TransportError>;
}
