//! Payment gateway boundary.
//!
//! The checkout flow talks to the PIX provider exclusively through the
//! [`PaymentGateway`] trait: one call creates a payment intent (an order with
//! a single PIX charge), a second polls the charge for settlement. The
//! concrete Pagar.me client lives in [`pagarme`]; tests substitute in-memory
//! doubles.
//!
//! ## Design
//! - Amounts cross this boundary as decimal strings ("9.90") and are
//!   converted to integer minor units (centavos) with round-half-up before
//!   anything touches the network
//! - Every intent creation carries a freshly generated idempotency token so
//!   transport-level retries cannot duplicate the order on the gateway
//! - Transport failures on status polls surface as errors; callers treat
//!   them as "unknown" and retry later, never as a failed payment

pub mod pagarme;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pagarme::PagarmeClient;

/// Errors produced at the gateway boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The amount could not be parsed as a positive decimal. Raised before
    /// any network call is made.
    #[error("invalid payment amount: {0:?}")]
    InvalidAmount(String),
    /// Transport failure or non-2xx response. Retryable by the caller.
    #[error("payment gateway request failed: {0}")]
    Request(String),
    /// A 2xx response that lacks a resolvable PIX transaction. Fatal for
    /// this attempt.
    #[error("payment gateway returned an unusable response: {0}")]
    Response(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// Buyer details attached to a payment intent.
#[derive(Debug, Clone, Serialize)]
pub struct BuyerInfo {
    /// Display name.
    pub name: String,
    /// Billing e-mail.
    pub email: String,
    /// Tax document number (CPF).
    pub document: String,
}

/// The displayable artifact of a created intent: a copy-pasteable PIX code
/// plus the URL of its QR image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentArtifact {
    pub code: String,
    pub image_url: String,
}

/// A successfully created payment intent.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    /// Gateway order id. Becomes the session identity.
    pub intent_id: String,
    /// Gateway charge id, used for status polling.
    pub charge_ref: String,
    /// What the buyer needs in order to pay.
    pub artifact: PaymentArtifact,
}

/// Settlement state of a charge as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    /// Charge created, funds not received.
    Pending,
    /// Funds received.
    Paid,
    /// Charge failed or was refused.
    Failed,
    /// Anything the gateway reports that we do not recognize, including
    /// transient lookup failures.
    Unknown,
}

impl SettlementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// The payment provider as the checkout flow sees it.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent for `amount` (decimal currency units, e.g.
    /// "9.90"). Exactly one network request per invocation; the caller is
    /// responsible for not invoking it twice for the same logical purchase.
    async fn create_intent(
        &self,
        amount: &str,
        buyer: &BuyerInfo,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Look up the settlement status of a charge.
    async fn settlement_status(&self, charge_ref: &str) -> Result<SettlementStatus, GatewayError>;
}

/// Convert a decimal currency amount into integer minor units, rounding to
/// the nearest unit with ties away from zero ("9.905" -> 991).
pub fn to_minor_units(amount: &str) -> Result<i64, GatewayError> {
    let value: Decimal = amount
        .trim()
        .parse()
        .map_err(|_| GatewayError::InvalidAmount(amount.to_string()))?;
    if value <= Decimal::ZERO {
        return Err(GatewayError::InvalidAmount(amount.to_string()));
    }
    let minor = (value * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    minor
        .to_i64()
        .ok_or_else(|| GatewayError::InvalidAmount(amount.to_string()))
}
