//! vendabot — a Telegram checkout bot for one-time digital goods paid via
//! PIX (Pagar.me).
//!
//! The interesting part is the payment session lifecycle in [`checkout`]:
//! idempotent intent creation, one active order per buyer enforced at the
//! store layer, a cancellable reminder campaign, and settlement finalization
//! that survives double-taps and races. [`gateway`] wraps the payment
//! provider, [`channels`] the chat transport, and [`bot`] wires the funnel
//! copy and routing on top.

pub mod bot;
pub mod channels;
pub mod checkout;
pub mod config;
pub mod gateway;
