//! The payment session lifecycle.
//!
//! `CheckoutFlow` is the state machine tying the gateway, the order store,
//! the reminder scheduler, and the delivery collaborators together:
//!
//! - no session → `start_purchase` → pending (intent created, order row
//!   replaces any prior one, prompt delivered, nudges scheduled)
//! - pending → `check_status` with a paid charge → settled (reminders
//!   cancelled, access delivered exactly once, row archived and removed)
//! - pending → `check_status` otherwise → still pending
//! - pending → `start_purchase` again (remarket) → the old session is
//!   destructively replaced and its reminders die with it
//!
//! All work for one buyer serializes on the per-user lock, so a double-tap
//! can never create two intents before the first replace lands, and a stale
//! status check can never finalize a session that was already replaced.
//!
//! There is no expiry sweep: an intent past its gateway-side window keeps
//! reporting non-paid and is superseded by the next `start_purchase`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::locks::UserLocks;
use super::reminders::{ReminderKind, ReminderScheduler};
use super::renderer::RenderError;
use super::store::{Order, OrderStatus, OrderStore, StoreError};
use crate::channels::TransportError;
use crate::gateway::{
    to_minor_units, BuyerInfo, GatewayError, PaymentArtifact, PaymentGateway, SettlementStatus,
};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Renders and delivers the payment prompt (QR image + copyable code) to the
/// buyer. Implemented by the bot layer; a failure aborts only the delivery,
/// never the session.
#[async_trait]
pub trait PromptDelivery: Send + Sync {
    async fn deliver_prompt(
        &self,
        user_key: &str,
        artifact: &PaymentArtifact,
    ) -> Result<(), FlowError>;
}

/// Delivers the purchased access once a session settles. Invoked exactly
/// once per settled order.
#[async_trait]
pub trait AccessProvisioner: Send + Sync {
    async fn deliver_access(&self, order: &Order) -> anyhow::Result<()>;
}

/// When the campaign nudges fire, relative to intent creation.
#[derive(Debug, Clone, Copy)]
pub struct ReminderPolicy {
    pub pending_nudge: Duration,
    pub discount_nudge: Duration,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            pending_nudge: Duration::from_secs(240),
            discount_nudge: Duration::from_secs(3600),
        }
    }
}

/// Outcome of a `check_status` request.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The charge settled; the session is finalized and access delivered.
    Settled(Order),
    /// Not settled yet (including gateway lookups that failed transiently);
    /// the buyer should wait and re-check.
    StillPending(Order),
    /// Nothing to check; the buyer has no active session.
    NoActiveOrder,
}

pub struct CheckoutFlow {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<OrderStore>,
    scheduler: Arc<ReminderScheduler>,
    prompt: Arc<dyn PromptDelivery>,
    provisioner: Arc<dyn AccessProvisioner>,
    locks: Arc<UserLocks>,
    policy: ReminderPolicy,
}

impl CheckoutFlow {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<OrderStore>,
        scheduler: Arc<ReminderScheduler>,
        prompt: Arc<dyn PromptDelivery>,
        provisioner: Arc<dyn AccessProvisioner>,
        locks: Arc<UserLocks>,
        policy: ReminderPolicy,
    ) -> Self {
        Self {
            gateway,
            store,
            scheduler,
            prompt,
            provisioner,
            locks,
            policy,
        }
    }

    /// Start (or restart) a purchase for a buyer: one gateway intent, the
    /// order row destructively replacing any prior session, fresh nudges,
    /// then the payment prompt.
    ///
    /// A prompt failure propagates but leaves the pending session and its
    /// reminders intact; the buyer can still pay and "check status".
    pub async fn start_purchase(
        &self,
        user_key: &str,
        buyer: &BuyerInfo,
        amount: &str,
        stage: u32,
    ) -> Result<Order, FlowError> {
        // Reject bad amounts before any network call.
        to_minor_units(amount)?;

        let lock = self.locks.for_user(user_key);
        let _guard = lock.lock().await;

        let intent = self.gateway.create_intent(amount, buyer).await?;
        let order = Order {
            order_id: intent.intent_id.clone(),
            user_key: user_key.to_string(),
            charge_ref: intent.charge_ref.clone(),
            buyer_label: buyer.name.clone(),
            status: OrderStatus::Pending,
            stage,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.replace(&order)?;

        // The replaced session's reminders die here; the new session gets
        // its own schedule.
        self.scheduler.cancel_all(user_key);
        self.scheduler.schedule(
            user_key,
            &order.order_id,
            self.policy.pending_nudge,
            ReminderKind::PaymentPending,
        );
        self.scheduler.schedule(
            user_key,
            &order.order_id,
            self.policy.discount_nudge,
            ReminderKind::DiscountOffer,
        );

        tracing::info!(user_key, order_id = %order.order_id, stage, "purchase started");

        self.prompt.deliver_prompt(user_key, &intent.artifact).await?;
        Ok(order)
    }

    /// Poll the gateway for the buyer's active session and finalize it if
    /// the charge settled.
    pub async fn check_status(&self, user_key: &str) -> Result<CheckOutcome, FlowError> {
        let lock = self.locks.for_user(user_key);
        let _guard = lock.lock().await;

        let Some(order) = self.store.find_active(user_key)? else {
            return Ok(CheckOutcome::NoActiveOrder);
        };

        let status = match self.gateway.settlement_status(&order.charge_ref).await {
            Ok(status) => status,
            Err(e) => {
                // A failed lookup is not a failed payment; the buyer retries.
                tracing::warn!(user_key, charge_ref = %order.charge_ref, "status lookup failed, treating as unknown: {e}");
                SettlementStatus::Unknown
            }
        };

        if status != SettlementStatus::Paid {
            tracing::debug!(user_key, order_id = %order.order_id, status = status.as_str(), "payment not settled yet");
            return Ok(CheckOutcome::StillPending(order));
        }

        self.finalize_settled(order).await
    }

    /// Record that the discounted offer was presented for this order.
    /// A missing row means the session resolved in the meantime; benign.
    pub async fn mark_discount_offered(
        &self,
        user_key: &str,
        order_id: &str,
    ) -> Result<(), FlowError> {
        let lock = self.locks.for_user(user_key);
        let _guard = lock.lock().await;

        match self.store.advance_stage(order_id) {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => {
                tracing::debug!(user_key, order_id, "stage advance on resolved session skipped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of completed sales to date.
    pub fn completed_sales(&self) -> Result<u64, FlowError> {
        Ok(self.store.completed_sales()?)
    }

    // Caller holds the user lock.
    async fn finalize_settled(&self, order: Order) -> Result<CheckOutcome, FlowError> {
        match self.store.mark_settled(&order.order_id) {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                // Another completion already finalized this session.
                tracing::debug!(order_id = %order.order_id, "settle race: session already finalized");
                return Ok(CheckOutcome::Settled(order));
            }
            Err(e) => return Err(e.into()),
        }

        self.scheduler.cancel_all(&order.user_key);

        // Delivery failures here are terminal per the transport contract
        // (unreachable recipients are never retried); settlement still
        // finalizes and the failure is logged for the operator.
        if let Err(e) = self.provisioner.deliver_access(&order).await {
            tracing::error!(user_key = %order.user_key, order_id = %order.order_id, "access delivery failed: {e}");
        }

        match self.store.delete(&order.order_id) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.store
            .record_sale(&order, chrono::Utc::now().timestamp())?;
        self.locks.prune_idle();

        tracing::info!(user_key = %order.user_key, order_id = %order.order_id, "sale completed");
        Ok(CheckOutcome::Settled(order))
    }
}
