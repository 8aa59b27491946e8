//! Payment prompt rendering.
//!
//! Turns a gateway [`PaymentArtifact`] into something the chat transport can
//! deliver: the QR image fetched and staged on disk, plus a MarkdownV2
//! caption carrying the payment instructions and the copy-pasteable PIX
//! code. The instructions and the raw code are escaped independently — PIX
//! codes routinely contain reserved markup characters.
//!
//! A failed fetch or staging aborts the whole delivery; a prompt with text
//! but no code (or the reverse) is never produced.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;

use crate::gateway::PaymentArtifact;

/// Characters the transport's MarkdownV2 dialect reserves.
const RESERVED: &str = "_*[]()~`>#+-=|{}.!";

#[derive(Debug, Error)]
pub enum RenderError {
    /// The QR image could not be fetched (transport failure or non-success
    /// status). The session stays pending; only this delivery is aborted.
    #[error("failed to fetch payment QR image: {0}")]
    ArtifactFetch(String),
    /// The fetched image could not be staged on disk.
    #[error("failed to stage payment QR image: {0}")]
    Stage(#[from] std::io::Error),
}

/// A fully rendered payment prompt. The staged image lives in a temporary
/// directory owned by this value; dropping the prompt (after send, or on a
/// failed send) releases it.
pub struct PaymentPrompt {
    _staging: TempDir,
    image_path: PathBuf,
    caption: String,
}

impl PaymentPrompt {
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }
}

pub struct PaymentRenderer {
    client: reqwest::Client,
    instructions: String,
}

impl PaymentRenderer {
    /// `instructions` is the human-readable copy shown above the PIX code;
    /// it is escaped at render time, so plain text is fine here.
    pub fn new(instructions: String, timeout_secs: u64) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RenderError::ArtifactFetch(e.to_string()))?;
        Ok(Self {
            client,
            instructions,
        })
    }

    /// Fetch the QR image and assemble the escaped caption.
    pub async fn render(&self, artifact: &PaymentArtifact) -> Result<PaymentPrompt, RenderError> {
        let resp = self
            .client
            .get(&artifact.image_url)
            .send()
            .await
            .map_err(|e| RenderError::ArtifactFetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RenderError::ArtifactFetch(format!(
                "QR image fetch returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RenderError::ArtifactFetch(e.to_string()))?;

        let staging = tempfile::tempdir()?;
        let image_path = staging.path().join("qrcode.png");
        tokio::fs::write(&image_path, &bytes).await?;
        tracing::debug!(path = %image_path.display(), "QR image staged");

        Ok(PaymentPrompt {
            _staging: staging,
            image_path,
            caption: build_caption(&self.instructions, &artifact.code),
        })
    }
}

/// Escape every reserved MarkdownV2 character with a backslash prefix.
/// Non-reserved characters pass through untouched.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if RESERVED.contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Caption layout: escaped instructions, blank line, escaped code wrapped in
/// backticks so the transport renders it copy-on-tap.
fn build_caption(instructions: &str, code: &str) -> String {
    format!(
        "{}\n\n`{}`",
        escape_markdown_v2(instructions),
        escape_markdown_v2(code)
    )
}
