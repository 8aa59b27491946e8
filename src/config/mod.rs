//! Configuration schema and loading.
//!
//! One TOML file, every field defaulted so a minimal config only needs the
//! two secrets — and those can come from the environment instead
//! (`TELEGRAM_BOT_TOKEN`, `PAGARME_SECRET_KEY`), which always wins over the
//! file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Default config path next to the binary's working directory.
pub const DEFAULT_CONFIG_PATH: &str = "vendabot.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub gateway: PagarmeConfig,
    pub checkout: CheckoutConfig,
    pub reminders: ReminderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token; usually supplied via `TELEGRAM_BOT_TOKEN`.
    pub token: String,
    /// Chat that receives operator funnel events. Disabled when unset.
    pub admin_chat_id: Option<String>,
    /// Timezone used for timestamps in operator events.
    pub admin_timezone: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            admin_chat_id: None,
            admin_timezone: "America/Sao_Paulo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PagarmeConfig {
    pub base_url: String,
    /// Secret key; usually supplied via `PAGARME_SECRET_KEY`.
    pub secret_key: String,
    pub request_timeout_secs: u64,
    /// PIX expiry window communicated to the gateway at intent creation.
    pub pix_expires_in_secs: u32,
}

impl Default for PagarmeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.pagar.me/core/v5".to_string(),
            secret_key: String::new(),
            request_timeout_secs: 8,
            pix_expires_in_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckoutConfig {
    /// Order database location.
    pub db_path: PathBuf,
    /// Price of the initial offer, decimal currency units.
    pub initial_price: String,
    /// Price of the remarket (discount) offer.
    pub discount_price: String,
    /// Billing e-mail attached to intents; the bot does not collect one.
    pub buyer_email: String,
    /// Tax document attached to intents; the bot does not collect one.
    pub buyer_document: String,
    /// Links delivered once a purchase settles.
    pub access_links: Vec<String>,
    /// Optional promo image sent with the /start pitch.
    pub promo_image: Option<PathBuf>,
    /// Timeout for fetching the QR image.
    pub artifact_timeout_secs: u64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("vendabot.db"),
            initial_price: "9.90".to_string(),
            discount_price: "6.99".to_string(),
            buyer_email: "comprador@example.com".to_string(),
            buyer_document: "00000000000".to_string(),
            access_links: Vec::new(),
            promo_image: None,
            artifact_timeout_secs: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReminderConfig {
    /// "Not paid yet" nudge delay.
    pub pending_nudge_secs: u64,
    /// Discounted-offer nudge delay.
    pub discount_nudge_secs: u64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            pending_nudge_secs: 240,
            discount_nudge_secs: 3600,
        }
    }
}

impl Config {
    /// Load from a TOML file (missing file means all defaults), then apply
    /// environment overrides for the secrets.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                config.telegram.token = token;
            }
        }
        if let Ok(secret) = std::env::var("PAGARME_SECRET_KEY") {
            if !secret.is_empty() {
                config.gateway.secret_key = secret;
            }
        }

        Ok(config)
    }

    /// Reject configurations that cannot possibly run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.token.is_empty() {
            anyhow::bail!("telegram token is not configured (set TELEGRAM_BOT_TOKEN or telegram.token)");
        }
        if self.gateway.secret_key.is_empty() {
            anyhow::bail!("gateway secret key is not configured (set PAGARME_SECRET_KEY or gateway.secret_key)");
        }
        crate::gateway::to_minor_units(&self.checkout.initial_price)
            .map_err(|e| anyhow::anyhow!("checkout.initial_price: {e}"))?;
        crate::gateway::to_minor_units(&self.checkout.discount_price)
            .map_err(|e| anyhow::anyhow!("checkout.discount_price: {e}"))?;
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.telegram
            .admin_timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown timezone {:?}", self.telegram.admin_timezone))
    }
}
