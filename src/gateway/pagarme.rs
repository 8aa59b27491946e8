//! Pagar.me core v5 client (PIX orders).
//!
//! Two endpoints are used:
//! - `POST /orders` creates an order with a single PIX charge and returns the
//!   copy-paste code plus QR image URL in `charges[0].last_transaction`
//! - `GET /charges/{id}` reports the charge status ("paid" once settled)
//!
//! Authentication is HTTP Basic with the secret key as username and an empty
//! password. Each order creation sends a fresh `Idempotency-Key` header so a
//! retried HTTP request cannot create a second order.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use uuid::Uuid;

use super::{
    to_minor_units, BuyerInfo, GatewayError, PaymentArtifact, PaymentGateway, PaymentIntent,
    SettlementStatus,
};
use crate::config::PagarmeConfig;

/// Placeholder contact number sent with every order; the bot does not
/// collect phone numbers and the gateway requires one.
const CONTACT_PHONE: (&str, &str, &str) = ("55", "11", "22180513");

pub struct PagarmeClient {
    base_url: String,
    secret_key: String,
    pix_expires_in_secs: u32,
    client: reqwest::Client,
}

impl PagarmeClient {
    pub fn new(config: &PagarmeConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            pix_expires_in_secs: config.pix_expires_in_secs,
            client,
        })
    }

    /// `Authorization` header value: Basic auth, secret key as username,
    /// empty password.
    fn auth_header(&self) -> String {
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:", self.secret_key));
        format!("Basic {credentials}")
    }
}

/// Request body for `POST /orders`.
fn order_body(amount_minor: i64, buyer: &BuyerInfo, expires_in_secs: u32) -> serde_json::Value {
    serde_json::json!({
        "items": [
            {
                "amount": amount_minor,
                "description": "Pagamento",
                "quantity": 1,
            }
        ],
        "customer": {
            "name": buyer.name,
            "email": buyer.email,
            "type": "individual",
            "document": buyer.document,
            "phones": {
                "mobile_phone": {
                    "country_code": CONTACT_PHONE.0,
                    "area_code": CONTACT_PHONE.1,
                    "number": CONTACT_PHONE.2,
                }
            }
        },
        "payments": [
            {
                "payment_method": "pix",
                "pix": {
                    "expires_in": expires_in_secs,
                }
            }
        ]
    })
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    #[serde(default)]
    charges: Vec<ChargeResponse>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    last_transaction: Option<LastTransaction>,
}

#[derive(Debug, Deserialize)]
struct LastTransaction {
    qr_code: Option<String>,
    qr_code_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeStatusResponse {
    status: String,
}

/// Extract a usable intent from the order response. The contract requires at
/// least one charge whose last transaction resolved to a PIX code and QR
/// image; anything less is an unusable response.
fn resolve_intent(response: OrderResponse) -> Result<PaymentIntent, GatewayError> {
    let order_id = response.id;
    let charge = response
        .charges
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Response(format!("order {order_id} has no charges")))?;
    let transaction = charge.last_transaction.ok_or_else(|| {
        GatewayError::Response(format!("charge {} has no payment transaction", charge.id))
    })?;
    match (transaction.qr_code, transaction.qr_code_url) {
        (Some(code), Some(image_url)) if !code.is_empty() && !image_url.is_empty() => {
            Ok(PaymentIntent {
                intent_id: order_id,
                charge_ref: charge.id,
                artifact: PaymentArtifact { code, image_url },
            })
        }
        _ => Err(GatewayError::Response(format!(
            "charge {} transaction is missing the PIX code or QR image",
            charge.id
        ))),
    }
}

#[async_trait]
impl PaymentGateway for PagarmeClient {
    async fn create_intent(
        &self,
        amount: &str,
        buyer: &BuyerInfo,
    ) -> Result<PaymentIntent, GatewayError> {
        let amount_minor = to_minor_units(amount)?;
        let idempotency_key = Uuid::new_v4().to_string();
        let body = order_body(amount_minor, buyer, self.pix_expires_in_secs);

        let resp = self
            .client
            .post(format!("{}/orders", self.base_url))
            .header("Authorization", self.auth_header())
            .header("Idempotency-Key", &idempotency_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Request(format!(
                "order creation failed ({status}): {detail}"
            )));
        }

        let parsed: OrderResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Response(format!("order response did not parse: {e}")))?;
        let intent = resolve_intent(parsed)?;
        tracing::info!(intent_id = %intent.intent_id, charge_ref = %intent.charge_ref, "payment intent created");
        Ok(intent)
    }

    async fn settlement_status(&self, charge_ref: &str) -> Result<SettlementStatus, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/charges/{charge_ref}", self.base_url))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(GatewayError::Request(format!(
                "charge lookup failed ({status})"
            )));
        }

        let parsed: ChargeStatusResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Response(format!("charge response did not parse: {e}")))?;
        Ok(SettlementStatus::from_wire(&parsed.status))
    }
}
