//! Reminder scheduling for pending payments.
//!
//! Each active order gets time-delayed nudges ("not paid yet" after a few
//! minutes, a discounted offer after an hour). Reminders are ephemeral,
//! in-memory tasks; the order store stays the single source of truth.
//!
//! ## Design
//! - `schedule` spawns a sleep-then-fire task and tracks its handle per
//!   buyer; it never blocks the caller
//! - `cancel_all` aborts every tracked task before returning, so a reminder
//!   that has not started running can never surface after settlement
//! - A firing reminder takes the buyer's lock just long enough to re-check
//!   the store: the scheduled order must still be the active pending one for
//!   that buyer. Absent or replaced state is a normal outcome and drops the
//!   reminder silently; delivery I/O happens after the lock is released
//! - One failing delivery is logged and isolated; it never touches other
//!   reminders

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::locks::UserLocks;
use super::store::{OrderStatus, OrderStore};

/// Which campaign message a reminder carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    /// "Your payment has not been credited yet" nudge.
    PaymentPending,
    /// Discounted remarket offer.
    DiscountOffer,
}

/// Delivery side of a fired reminder, implemented by the bot layer.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn deliver(
        &self,
        user_key: &str,
        order_id: &str,
        kind: ReminderKind,
    ) -> anyhow::Result<()>;
}

struct TrackedReminder {
    id: u64,
    handle: JoinHandle<()>,
}

pub struct ReminderScheduler {
    store: Arc<OrderStore>,
    sink: Arc<dyn ReminderSink>,
    locks: Arc<UserLocks>,
    pending: parking_lot::Mutex<HashMap<String, Vec<TrackedReminder>>>,
    next_id: AtomicU64,
}

impl ReminderScheduler {
    pub fn new(store: Arc<OrderStore>, sink: Arc<dyn ReminderSink>, locks: Arc<UserLocks>) -> Self {
        Self {
            store,
            sink,
            locks,
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Schedule a reminder for `order_id` to fire after `delay`.
    pub fn schedule(
        self: &Arc<Self>,
        user_key: &str,
        order_id: &str,
        delay: Duration,
        kind: ReminderKind,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::clone(self);
        let user = user_key.to_string();
        let order = order_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(&user, &order, kind, id).await;
        });

        self.pending
            .lock()
            .entry(user_key.to_string())
            .or_default()
            .push(TrackedReminder { id, handle });
        tracing::debug!(user_key, order_id, ?kind, delay_secs = delay.as_secs(), "reminder scheduled");
    }

    /// Abort every pending reminder for a buyer. Once this returns, no
    /// not-yet-started reminder for the key will produce output; a callback
    /// already past its validity check may still complete.
    pub fn cancel_all(&self, user_key: &str) {
        let Some(tracked) = self.pending.lock().remove(user_key) else {
            return;
        };
        let count = tracked.len();
        for reminder in tracked {
            reminder.handle.abort();
        }
        tracing::debug!(user_key, count, "reminders cancelled");
    }

    /// Pending reminder count for a buyer (finished tasks may still be
    /// counted until they untrack themselves).
    pub fn pending_count(&self, user_key: &str) -> usize {
        self.pending
            .lock()
            .get(user_key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn fire(&self, user_key: &str, order_id: &str, kind: ReminderKind, id: u64) {
        // Hold the buyer's lock only for the validity check; delivery I/O
        // runs unlocked.
        let lock = self.locks.for_user(user_key);
        let still_current = {
            let _guard = lock.lock().await;
            match self.store.find_active(user_key) {
                Ok(Some(order)) => {
                    order.order_id == order_id && order.status == OrderStatus::Pending
                }
                // No state for this buyer is a normal outcome: the order
                // settled, was replaced, or never finished persisting.
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(user_key, order_id, "reminder validity check failed: {e}");
                    false
                }
            }
        };

        if !still_current {
            tracing::debug!(user_key, order_id, ?kind, "stale reminder dropped");
            self.untrack(user_key, id);
            return;
        }

        if let Err(e) = self.sink.deliver(user_key, order_id, kind).await {
            tracing::warn!(user_key, order_id, ?kind, "reminder delivery failed: {e}");
        }
        self.untrack(user_key, id);
    }

    fn untrack(&self, user_key: &str, id: u64) {
        let mut pending = self.pending.lock();
        if let Some(tracked) = pending.get_mut(user_key) {
            tracked.retain(|r| r.id != id);
            if tracked.is_empty() {
                pending.remove(user_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::store::Order;

    struct RecordingSink {
        delivered: parking_lot::Mutex<Vec<(String, String, ReminderKind)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn delivered(&self) -> Vec<(String, String, ReminderKind)> {
            self.delivered.lock().clone()
        }
    }

    #[async_trait]
    impl ReminderSink for RecordingSink {
        async fn deliver(
            &self,
            user_key: &str,
            order_id: &str,
            kind: ReminderKind,
        ) -> anyhow::Result<()> {
            self.delivered
                .lock()
                .push((user_key.to_string(), order_id.to_string(), kind));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ReminderSink for FailingSink {
        async fn deliver(&self, _: &str, _: &str, _: ReminderKind) -> anyhow::Result<()> {
            anyhow::bail!("recipient unreachable")
        }
    }

    fn pending_order(user_key: &str, order_id: &str) -> Order {
        Order {
            order_id: order_id.into(),
            user_key: user_key.into(),
            charge_ref: format!("ch_{order_id}"),
            buyer_label: "maria".into(),
            status: OrderStatus::Pending,
            stage: 0,
            created_at: 0,
        }
    }

    fn scheduler_with(
        sink: Arc<dyn ReminderSink>,
    ) -> (Arc<ReminderScheduler>, Arc<OrderStore>) {
        let store = Arc::new(OrderStore::open_in_memory().unwrap());
        let locks = Arc::new(UserLocks::new());
        let scheduler = Arc::new(ReminderScheduler::new(Arc::clone(&store), sink, locks));
        (scheduler, store)
    }

    #[tokio::test]
    async fn fires_for_active_pending_order() {
        let sink = RecordingSink::new();
        let (scheduler, store) = scheduler_with(sink.clone());
        store.replace(&pending_order("u1", "or_1")).unwrap();

        scheduler.schedule("u1", "or_1", Duration::from_millis(20), ReminderKind::PaymentPending);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(
            sink.delivered(),
            vec![("u1".to_string(), "or_1".to_string(), ReminderKind::PaymentPending)]
        );
        assert_eq!(scheduler.pending_count("u1"), 0);
    }

    #[tokio::test]
    async fn dropped_when_no_state_exists() {
        // The order was never persisted; firing into missing state must be a
        // silent no-op, not a crash.
        let sink = RecordingSink::new();
        let (scheduler, _store) = scheduler_with(sink.clone());

        scheduler.schedule("u1", "or_1", Duration::from_millis(20), ReminderKind::PaymentPending);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn dropped_when_order_was_replaced() {
        let sink = RecordingSink::new();
        let (scheduler, store) = scheduler_with(sink.clone());
        store.replace(&pending_order("u1", "or_1")).unwrap();

        scheduler.schedule("u1", "or_1", Duration::from_millis(30), ReminderKind::DiscountOffer);
        store.replace(&pending_order("u1", "or_2")).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn dropped_when_order_settled() {
        let sink = RecordingSink::new();
        let (scheduler, store) = scheduler_with(sink.clone());
        store.replace(&pending_order("u1", "or_1")).unwrap();

        scheduler.schedule("u1", "or_1", Duration::from_millis(30), ReminderKind::PaymentPending);
        store.mark_settled("or_1").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn cancel_all_prevents_firing() {
        let sink = RecordingSink::new();
        let (scheduler, store) = scheduler_with(sink.clone());
        store.replace(&pending_order("u1", "or_1")).unwrap();

        scheduler.schedule("u1", "or_1", Duration::from_millis(30), ReminderKind::PaymentPending);
        scheduler.schedule("u1", "or_1", Duration::from_millis(40), ReminderKind::DiscountOffer);
        assert_eq!(scheduler.pending_count("u1"), 2);

        scheduler.cancel_all("u1");
        assert_eq!(scheduler.pending_count("u1"), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sink.delivered().is_empty());
    }

    #[tokio::test]
    async fn cancel_all_for_unknown_user_is_noop() {
        let sink = RecordingSink::new();
        let (scheduler, _store) = scheduler_with(sink);
        scheduler.cancel_all("nobody");
    }

    #[tokio::test]
    async fn users_fire_independently() {
        let sink = RecordingSink::new();
        let (scheduler, store) = scheduler_with(sink.clone());
        store.replace(&pending_order("u1", "or_1")).unwrap();
        store.replace(&pending_order("u2", "or_2")).unwrap();

        scheduler.schedule("u1", "or_1", Duration::from_millis(20), ReminderKind::PaymentPending);
        scheduler.schedule("u2", "or_2", Duration::from_millis(20), ReminderKind::PaymentPending);
        scheduler.cancel_all("u1");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            sink.delivered(),
            vec![("u2".to_string(), "or_2".to_string(), ReminderKind::PaymentPending)]
        );
    }

    #[tokio::test]
    async fn failing_delivery_does_not_affect_others() {
        let store = Arc::new(OrderStore::open_in_memory().unwrap());
        let locks = Arc::new(UserLocks::new());
        let failing = Arc::new(ReminderScheduler::new(
            Arc::clone(&store),
            Arc::new(FailingSink),
            Arc::clone(&locks),
        ));
        store.replace(&pending_order("u1", "or_1")).unwrap();

        failing.schedule("u1", "or_1", Duration::from_millis(20), ReminderKind::PaymentPending);
        failing.schedule("u1", "or_1", Duration::from_millis(30), ReminderKind::DiscountOffer);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Both fired and failed independently; tracking drained either way
        assert_eq!(failing.pending_count("u1"), 0);
    }

    #[tokio::test]
    async fn validity_check_waits_for_user_lock() {
        // Hold the buyer's lock past the fire deadline while settling the
        // order; the reminder must observe the settled state and drop.
        let sink = RecordingSink::new();
        let (scheduler, store) = scheduler_with(sink.clone());
        store.replace(&pending_order("u1", "or_1")).unwrap();

        let lock = scheduler.locks.for_user("u1");
        let guard = lock.lock().await;
        scheduler.schedule("u1", "or_1", Duration::from_millis(20), ReminderKind::PaymentPending);

        tokio::time::sleep(Duration::from_millis(80)).await;
        store.mark_settled("or_1").unwrap();
        scheduler.cancel_all("u1");
        drop(guard);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sink.delivered().is_empty());
    }
}
