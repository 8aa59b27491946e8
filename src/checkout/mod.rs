//! Checkout: the payment session lifecycle.
//!
//! One buyer has at most one active order at a time. Starting a purchase
//! creates a gateway intent and destructively replaces any prior session;
//! pending sessions get cancellable reminder nudges; a settled session is
//! finalized exactly once (access delivered, terminal record kept, active
//! row removed).
//!
//! ## Design
//! - SQLite order store; `user_key` primary key enforces the
//!   one-active-order invariant at the schema level
//! - Per-buyer async locks serialize purchase start, settlement finalize,
//!   and reminder validity checks
//! - Reminders are in-memory tasks that re-check the store at fire time and
//!   drop silently when their session is gone

pub mod flow;
pub mod locks;
pub mod reminders;
pub mod renderer;
pub mod store;

pub use flow::{
    AccessProvisioner, CheckOutcome, CheckoutFlow, FlowError, PromptDelivery, ReminderPolicy,
};
pub use locks::UserLocks;
pub use reminders::{ReminderKind, ReminderScheduler, ReminderSink};
pub use renderer::{escape_markdown_v2, PaymentPrompt, PaymentRenderer, RenderError};
pub use store::{Order, OrderStatus, OrderStore, StoreError};
