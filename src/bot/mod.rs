//! Purchase-funnel bot layer.
//!
//! Routes incoming chat events into the checkout flow and owns everything
//! user-facing: campaign copy, inline buttons, the payment-prompt delivery,
//! the reminder messages, the post-settlement access delivery, and the
//! operator event log.
//!
//! Handlers run in per-event tasks; one buyer's slow gateway call never
//! stalls another buyer, while the flow's per-user locks keep each buyer's
//! own actions serialized.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channels::{ChannelEvent, ChatTransport, InlineButton, TransportError};
use crate::checkout::{
    AccessProvisioner, CheckOutcome, CheckoutFlow, FlowError, Order, PaymentRenderer,
    PromptDelivery, ReminderKind, ReminderSink,
};
use crate::config::{CheckoutConfig, Config};
use crate::gateway::{BuyerInfo, PaymentArtifact};

// ── Funnel actions ───────────────────────────────────────────────

const ACTION_BUY: &str = "compra";
const ACTION_CHECK: &str = "verifica";
const ACTION_REMARKET: &str = "remarket";

// ── Campaign copy ────────────────────────────────────────────────

const GENERATING: &str = "🤖 Gerando seu pagamento... Aguarde!";
const PROCEED: &str = "Para prosseguir com o pagamento, clique no botão abaixo.";
const PENDING_NUDGE: &str = "⛔️ Seu pagamento ainda não foi creditado em nosso sistema. \
    A aprovação leva em torno de 10 a 60 segundos após a compra feita.";
const WAIT: &str = "Seu pagamento ainda não foi aprovado. Por favor, aguarde e verifique novamente.";
const APPROVED: &str = "✅ Seu pagamento foi aprovado! Obrigado por sua compra.";
const THANKS: &str = "Esperamos que goste ❤";
const NO_ORDER: &str = "Você ainda não tem um pagamento em andamento. Envie /start para começar.";
const PURCHASE_FAILURE: &str =
    "Ocorreu um erro ao processar seu pagamento. Por favor, tente novamente mais tarde.";
const CHECK_FAILURE: &str = "Não foi possível verificar o status da sua compra no momento.";

fn welcome_message(price: &str) -> String {
    format!(
        "🔥 Acesso vitalício ao nosso conteúdo digital com um pagamento único de R$ {price}.\n\n\
         🔔 Toque em \"QUERO COMPRAR ✅\" e receba o acesso imediatamente após a confirmação do PIX."
    )
}

fn pix_instructions(expiry_minutes: u32) -> String {
    format!(
        "🅾️ Pagamento gerado! Você tem {expiry_minutes} minutos para concluir o PIX.\n\n\
         ✅ Toque no código abaixo para copiar e finalize a sua compra ⬇️"
    )
}

fn discount_offer_message(price: &str) -> String {
    format!(
        "👋🏻 Vimos que você gerou o pagamento e ainda não concluiu a compra. \
         Para você não perder a oferta, baixamos o valor para R$ {price}.\n\n\
         ✅ Toque em \"QUERO ADQUIRIR 🎉\" para gerar um novo PIX com desconto."
    )
}

fn access_message(links: &[String]) -> String {
    if links.is_empty() {
        return APPROVED.to_string();
    }
    let mut message = String::from("Seu acesso 👇");
    for link in links {
        message.push_str("\n\n");
        message.push_str(link);
    }
    message
}

// ── Operator events ──────────────────────────────────────────────

/// Funnel milestones reported to the operator chat.
#[derive(Debug, Clone)]
pub enum AdminEvent {
    LeadStarted {
        name: String,
        username: Option<String>,
    },
    SaleCompleted {
        buyer: String,
    },
    SaleStillPending {
        buyer: String,
    },
    RecipientBlocked {
        buyer: String,
    },
}

fn format_admin_event(event: &AdminEvent, stamp: &str) -> String {
    match event {
        AdminEvent::LeadStarted { name, username } => format!(
            "BOT INICIADO 💥\nNome do lead: {name}\nUsuário: @{}\nHora: {stamp}",
            username.as_deref().unwrap_or("-")
        ),
        AdminEvent::SaleCompleted { buyer } => {
            format!("COMPRA EFETUADA ✅\nUsuário: @{buyer}\nHora: {stamp}")
        }
        AdminEvent::SaleStillPending { buyer } => {
            format!("COMPRA NÃO EFETUADA ⛔️\nUsuário: @{buyer}\nHora: {stamp}")
        }
        AdminEvent::RecipientBlocked { buyer } => {
            format!("USUÁRIO BLOQUEOU O BOT ⛔️\nUsuário: @{buyer}\nHora: {stamp}")
        }
    }
}

/// Delivers operator events to the configured admin chat, if any. Failures
/// are logged and never propagate into the funnel.
pub struct AdminNotifier {
    transport: Arc<dyn ChatTransport>,
    chat_id: Option<String>,
    tz: chrono_tz::Tz,
}

impl AdminNotifier {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        chat_id: Option<String>,
        tz: chrono_tz::Tz,
    ) -> Self {
        Self {
            transport,
            chat_id,
            tz,
        }
    }

    pub async fn notify(&self, event: AdminEvent) {
        let Some(chat_id) = &self.chat_id else {
            return;
        };
        let stamp = chrono::Utc::now()
            .with_timezone(&self.tz)
            .format("%H:%M:%S")
            .to_string();
        let message = format_admin_event(&event, &stamp);
        if let Err(e) = self.transport.send_text(chat_id, &message).await {
            tracing::debug!("operator event not delivered: {e}");
        }
    }
}

// ── Prompt delivery ──────────────────────────────────────────────

/// Renders the payment prompt (QR + escaped caption) and pushes it to the
/// buyer. The flow calls this as its delivery step.
pub struct PromptCourier {
    renderer: PaymentRenderer,
    transport: Arc<dyn ChatTransport>,
}

impl PromptCourier {
    pub fn new(renderer: PaymentRenderer, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            renderer,
            transport,
        }
    }
}

#[async_trait]
impl PromptDelivery for PromptCourier {
    async fn deliver_prompt(
        &self,
        user_key: &str,
        artifact: &PaymentArtifact,
    ) -> Result<(), FlowError> {
        let prompt = self.renderer.render(artifact).await?;
        self.transport
            .send_photo(user_key, prompt.image_path(), Some(prompt.caption()))
            .await?;
        Ok(())
    }
}

// ── The bot ──────────────────────────────────────────────────────

/// Pricing and delivery settings lifted from the checkout config.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub initial_price: String,
    pub discount_price: String,
    pub buyer_email: String,
    pub buyer_document: String,
    pub access_links: Vec<String>,
    pub promo_image: Option<PathBuf>,
}

impl BotSettings {
    pub fn from_config(config: &CheckoutConfig) -> Self {
        Self {
            initial_price: config.initial_price.clone(),
            discount_price: config.discount_price.clone(),
            buyer_email: config.buyer_email.clone(),
            buyer_document: config.buyer_document.clone(),
            access_links: config.access_links.clone(),
            promo_image: config.promo_image.clone(),
        }
    }
}

/// Which offer a purchase action carries.
#[derive(Debug, Clone, Copy)]
enum Offer {
    Initial,
    Remarket,
}

pub struct PurchaseBot {
    transport: Arc<dyn ChatTransport>,
    admin: AdminNotifier,
    settings: BotSettings,
    // Set after construction: the flow needs this bot (as reminder sink and
    // access provisioner) before the bot can hold the flow.
    flow: OnceLock<Arc<CheckoutFlow>>,
}

impl PurchaseBot {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        admin: AdminNotifier,
        settings: BotSettings,
    ) -> Self {
        Self {
            transport,
            admin,
            settings,
            flow: OnceLock::new(),
        }
    }

    /// Wire in the checkout flow; must happen before the first event.
    pub fn attach_flow(&self, flow: Arc<CheckoutFlow>) {
        if self.flow.set(flow).is_err() {
            tracing::warn!("checkout flow attached twice; keeping the first");
        }
    }

    /// The payment-prompt copy used for the QR caption.
    pub fn prompt_instructions(expiry_secs: u32) -> String {
        pix_instructions(expiry_secs.div_ceil(60))
    }

    fn flow(&self) -> Option<&Arc<CheckoutFlow>> {
        let flow = self.flow.get();
        if flow.is_none() {
            tracing::error!("event arrived before the checkout flow was attached");
        }
        flow
    }

    fn buyer_info(&self, display_name: &str) -> BuyerInfo {
        BuyerInfo {
            name: display_name.to_string(),
            email: self.settings.buyer_email.clone(),
            document: self.settings.buyer_document.clone(),
        }
    }

    /// Send text, converting an unreachable recipient into an operator
    /// event. The error still propagates so callers stop the funnel step.
    async fn guarded_text(&self, user_key: &str, text: &str) -> anyhow::Result<()> {
        match self.transport.send_text(user_key, text).await {
            Ok(()) => Ok(()),
            Err(TransportError::Unreachable) => {
                self.admin
                    .notify(AdminEvent::RecipientBlocked {
                        buyer: user_key.to_string(),
                    })
                    .await;
                Err(TransportError::Unreachable.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain events, handling each in its own task.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = rx.recv().await {
            let bot = Arc::clone(&self);
            tokio::spawn(async move {
                bot.handle_event(event).await;
            });
        }
        tracing::info!("event channel closed; bot loop ending");
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        let user_key = event.user_key().to_string();
        let display_name = event.display_name().to_string();

        let result = match &event {
            ChannelEvent::Command { command, .. } => match command.as_str() {
                "start" => self.handle_start(&user_key, &display_name, &event).await,
                "help" => self.handle_help(&user_key).await,
                other => {
                    tracing::debug!(command = other, "ignoring unknown command");
                    Ok(())
                }
            },
            ChannelEvent::Action { action, .. } => match action.as_str() {
                ACTION_BUY => self.handle_buy(&user_key, &display_name, Offer::Initial).await,
                ACTION_REMARKET => {
                    self.handle_buy(&user_key, &display_name, Offer::Remarket)
                        .await
                }
                ACTION_CHECK => self.handle_check(&user_key, &display_name).await,
                other => {
                    tracing::debug!(action = other, "ignoring unknown action");
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            tracing::error!(user_key = %user_key, "handler failed: {e}");
        }
    }

    async fn handle_start(
        &self,
        user_key: &str,
        display_name: &str,
        event: &ChannelEvent,
    ) -> anyhow::Result<()> {
        self.guarded_text(user_key, &welcome_message(&self.settings.initial_price))
            .await?;

        if let Some(promo) = &self.settings.promo_image {
            if promo.exists() {
                if let Err(e) = self.transport.send_photo(user_key, promo, None).await {
                    tracing::warn!(user_key, "promo image not delivered: {e}");
                }
            }
        }

        self.transport
            .send_choices(
                user_key,
                PROCEED,
                &[InlineButton::new("QUERO COMPRAR ✅", ACTION_BUY)],
            )
            .await?;

        let username = match event {
            ChannelEvent::Command { username, .. } | ChannelEvent::Action { username, .. } => {
                username.clone()
            }
        };
        self.admin
            .notify(AdminEvent::LeadStarted {
                name: display_name.to_string(),
                username,
            })
            .await;
        Ok(())
    }

    async fn handle_help(&self, user_key: &str) -> anyhow::Result<()> {
        self.transport
            .send_choices(
                user_key,
                PROCEED,
                &[InlineButton::new("Verificar ✅", ACTION_CHECK)],
            )
            .await?;
        Ok(())
    }

    async fn handle_buy(
        &self,
        user_key: &str,
        display_name: &str,
        offer: Offer,
    ) -> anyhow::Result<()> {
        let Some(flow) = self.flow() else {
            return Ok(());
        };
        let (amount, stage) = match offer {
            Offer::Initial => (self.settings.initial_price.as_str(), 0),
            Offer::Remarket => (self.settings.discount_price.as_str(), 1),
        };

        self.guarded_text(user_key, GENERATING).await?;

        match flow
            .start_purchase(user_key, &self.buyer_info(display_name), amount, stage)
            .await
        {
            Ok(_order) => {
                self.transport
                    .send_choices(
                        user_key,
                        PROCEED,
                        &[InlineButton::new("⏱️ Verificar meu pagamento", ACTION_CHECK)],
                    )
                    .await?;
                Ok(())
            }
            Err(FlowError::Transport(TransportError::Unreachable)) => {
                self.admin
                    .notify(AdminEvent::RecipientBlocked {
                        buyer: display_name.to_string(),
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(user_key, "purchase start failed: {e}");
                // A single retryable failure message, whatever went wrong.
                let _ = self.transport.send_text(user_key, PURCHASE_FAILURE).await;
                Ok(())
            }
        }
    }

    async fn handle_check(&self, user_key: &str, display_name: &str) -> anyhow::Result<()> {
        let Some(flow) = self.flow() else {
            return Ok(());
        };

        match flow.check_status(user_key).await {
            Ok(CheckOutcome::Settled(order)) => {
                // The buyer was already served by the access provisioner.
                self.admin
                    .notify(AdminEvent::SaleCompleted {
                        buyer: order.buyer_label,
                    })
                    .await;
                Ok(())
            }
            Ok(CheckOutcome::StillPending(_order)) => {
                self.guarded_text(user_key, WAIT).await?;
                self.transport
                    .send_choices(
                        user_key,
                        PROCEED,
                        &[InlineButton::new("⚠️ Pagamento Pendente", ACTION_CHECK)],
                    )
                    .await?;
                self.admin
                    .notify(AdminEvent::SaleStillPending {
                        buyer: display_name.to_string(),
                    })
                    .await;
                Ok(())
            }
            Ok(CheckOutcome::NoActiveOrder) => {
                self.transport.send_text(user_key, NO_ORDER).await?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(user_key, "status check failed: {e}");
                let _ = self.transport.send_text(user_key, CHECK_FAILURE).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ReminderSink for PurchaseBot {
    async fn deliver(
        &self,
        user_key: &str,
        order_id: &str,
        kind: ReminderKind,
    ) -> anyhow::Result<()> {
        match kind {
            ReminderKind::PaymentPending => {
                self.guarded_text(user_key, PENDING_NUDGE).await?;
            }
            ReminderKind::DiscountOffer => {
                if let Some(flow) = self.flow.get() {
                    flow.mark_discount_offered(user_key, order_id).await?;
                }
                self.guarded_text(
                    user_key,
                    &discount_offer_message(&self.settings.discount_price),
                )
                .await?;
                self.transport
                    .send_choices(
                        user_key,
                        PROCEED,
                        &[InlineButton::new("QUERO ADQUIRIR 🎉", ACTION_REMARKET)],
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AccessProvisioner for PurchaseBot {
    async fn deliver_access(&self, order: &Order) -> anyhow::Result<()> {
        self.guarded_text(&order.user_key, APPROVED).await?;
        self.guarded_text(&order.user_key, &access_message(&self.settings.access_links))
            .await?;
        self.guarded_text(&order.user_key, THANKS).await?;
        Ok(())
    }
}

/// Build the whole funnel stack from config: transport-facing bot, reminder
/// scheduler, and checkout flow, wired together.
pub fn build(
    config: &Config,
    transport: Arc<dyn ChatTransport>,
) -> anyhow::Result<(Arc<PurchaseBot>, Arc<CheckoutFlow>)> {
    use crate::checkout::{OrderStore, ReminderPolicy, ReminderScheduler, UserLocks};
    use crate::gateway::PagarmeClient;

    let store = Arc::new(
        OrderStore::open(&config.checkout.db_path)
            .map_err(|e| anyhow::anyhow!("opening order store: {e}"))?,
    );
    let locks = Arc::new(UserLocks::new());
    let gateway = Arc::new(
        PagarmeClient::new(&config.gateway)
            .map_err(|e| anyhow::anyhow!("building gateway client: {e}"))?,
    );
    let renderer = PaymentRenderer::new(
        PurchaseBot::prompt_instructions(config.gateway.pix_expires_in_secs),
        config.checkout.artifact_timeout_secs,
    )
    .map_err(|e| anyhow::anyhow!("building prompt renderer: {e}"))?;

    let admin = AdminNotifier::new(
        Arc::clone(&transport),
        config.telegram.admin_chat_id.clone(),
        config.timezone()?,
    );
    let bot = Arc::new(PurchaseBot::new(
        Arc::clone(&transport),
        admin,
        BotSettings::from_config(&config.checkout),
    ));

    let scheduler = Arc::new(ReminderScheduler::new(
        Arc::clone(&store),
        bot.clone() as Arc<dyn ReminderSink>,
        Arc::clone(&locks),
    ));
    let courier = Arc::new(PromptCourier::new(renderer, Arc::clone(&transport)));
    let flow = Arc::new(CheckoutFlow::new(
        gateway,
        store,
        scheduler,
        courier,
        bot.clone() as Arc<dyn AccessProvisioner>,
        locks,
        ReminderPolicy {
            pending_nudge: std::time::Duration::from_secs(config.reminders.pending_nudge_secs),
            discount_nudge: std::time::Duration::from_secs(config.reminders.discount_nudge_secs),
        },
    ));
    bot.attach_flow(Arc::clone(&flow));

    Ok((bot, flow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{OrderStore, ReminderPolicy, ReminderScheduler, UserLocks};
    use crate::gateway::{GatewayError, PaymentGateway, PaymentIntent, SettlementStatus};
    use std::path::Path;
    use std::time::Duration;

    // ── Test doubles ─────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text { to: String, text: String },
        Photo { to: String },
        Choices { to: String, actions: Vec<String> },
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: parking_lot::Mutex<Vec<Sent>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        fn texts_to(&self, user: &str) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Text { to, text } if to == user => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(&self, recipient: &str, text: &str) -> Result<(), TransportError> {
            self.sent.lock().push(Sent::Text {
                to: recipient.to_string(),
                text: text.to_string(),
            });
            Ok(())
        }

        async fn send_photo(
            &self,
            recipient: &str,
            _image: &Path,
            _caption: Option<&str>,
        ) -> Result<(), TransportError> {
            self.sent.lock().push(Sent::Photo {
                to: recipient.to_string(),
            });
            Ok(())
        }

        async fn send_choices(
            &self,
            recipient: &str,
            _text: &str,
            buttons: &[InlineButton],
        ) -> Result<(), TransportError> {
            self.sent.lock().push(Sent::Choices {
                to: recipient.to_string(),
                actions: buttons.iter().map(|b| b.action.clone()).collect(),
            });
            Ok(())
        }
    }

    struct TestGateway {
        status: parking_lot::Mutex<SettlementStatus>,
        next: std::sync::atomic::AtomicUsize,
    }

    impl TestGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                status: parking_lot::Mutex::new(SettlementStatus::Pending),
                next: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PaymentGateway for TestGateway {
        async fn create_intent(
            &self,
            _amount: &str,
            _buyer: &BuyerInfo,
        ) -> Result<PaymentIntent, GatewayError> {
            let n = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(PaymentIntent {
                intent_id: format!("or_{n}"),
                charge_ref: format!("ch_{n}"),
                artifact: PaymentArtifact {
                    code: "00020126".into(),
                    image_url: "https://gateway.example/qr.png".into(),
                },
            })
        }

        async fn settlement_status(&self, _: &str) -> Result<SettlementStatus, GatewayError> {
            Ok(*self.status.lock())
        }
    }

    struct NoopPrompt;

    #[async_trait]
    impl PromptDelivery for NoopPrompt {
        async fn deliver_prompt(&self, _: &str, _: &PaymentArtifact) -> Result<(), FlowError> {
            Ok(())
        }
    }

    struct Harness {
        bot: Arc<PurchaseBot>,
        transport: Arc<RecordingTransport>,
        gateway: Arc<TestGateway>,
    }

    fn harness(admin_chat: Option<&str>) -> Harness {
        let transport = Arc::new(RecordingTransport::default());
        let gateway = TestGateway::new();
        let store = Arc::new(OrderStore::open_in_memory().unwrap());
        let locks = Arc::new(UserLocks::new());

        let admin = AdminNotifier::new(
            transport.clone(),
            admin_chat.map(String::from),
            chrono_tz::Tz::America__Sao_Paulo,
        );
        let settings = BotSettings {
            initial_price: "9.90".into(),
            discount_price: "6.99".into(),
            buyer_email: "comprador@example.com".into(),
            buyer_document: "00000000000".into(),
            access_links: vec!["https://t.me/+vip".into()],
            promo_image: None,
        };
        let bot = Arc::new(PurchaseBot::new(transport.clone(), admin, settings));

        let scheduler = Arc::new(ReminderScheduler::new(
            Arc::clone(&store),
            bot.clone() as Arc<dyn ReminderSink>,
            Arc::clone(&locks),
        ));
        let flow = Arc::new(CheckoutFlow::new(
            gateway.clone(),
            store,
            scheduler,
            Arc::new(NoopPrompt),
            bot.clone() as Arc<dyn AccessProvisioner>,
            locks,
            ReminderPolicy {
                pending_nudge: Duration::from_secs(600),
                discount_nudge: Duration::from_secs(1200),
            },
        ));
        bot.attach_flow(flow);

        Harness {
            bot,
            transport,
            gateway,
        }
    }

    fn command(user: &str, command: &str) -> ChannelEvent {
        ChannelEvent::Command {
            user_key: user.into(),
            username: Some("maria_s".into()),
            first_name: Some("Maria".into()),
            command: command.into(),
        }
    }

    fn action(user: &str, action: &str) -> ChannelEvent {
        ChannelEvent::Action {
            user_key: user.into(),
            username: Some("maria_s".into()),
            first_name: Some("Maria".into()),
            action: action.into(),
        }
    }

    // ── Copy helpers ─────────────────────────────────────────────

    #[test]
    fn welcome_message_carries_price() {
        assert!(welcome_message("9.90").contains("R$ 9.90"));
    }

    #[test]
    fn discount_message_carries_price() {
        assert!(discount_offer_message("6.99").contains("R$ 6.99"));
    }

    #[test]
    fn prompt_instructions_round_expiry_up() {
        assert!(PurchaseBot::prompt_instructions(1800).contains("30 minutos"));
        assert!(PurchaseBot::prompt_instructions(1801).contains("31 minutos"));
    }

    #[test]
    fn access_message_joins_links() {
        let message = access_message(&["https://a".into(), "https://b".into()]);
        assert!(message.starts_with("Seu acesso 👇"));
        assert!(message.contains("https://a"));
        assert!(message.contains("https://b"));
    }

    #[test]
    fn admin_event_formats() {
        let stamp = "12:30:00";
        let lead = format_admin_event(
            &AdminEvent::LeadStarted {
                name: "Maria".into(),
                username: Some("maria_s".into()),
            },
            stamp,
        );
        assert!(lead.contains("BOT INICIADO"));
        assert!(lead.contains("@maria_s"));
        assert!(lead.contains("12:30:00"));

        let sale = format_admin_event(&AdminEvent::SaleCompleted { buyer: "m".into() }, stamp);
        assert!(sale.contains("COMPRA EFETUADA"));

        let blocked =
            format_admin_event(&AdminEvent::RecipientBlocked { buyer: "m".into() }, stamp);
        assert!(blocked.contains("BLOQUEOU"));
    }

    #[test]
    fn lead_event_without_username() {
        let lead = format_admin_event(
            &AdminEvent::LeadStarted {
                name: "Maria".into(),
                username: None,
            },
            "00:00:00",
        );
        assert!(lead.contains("@-"));
    }

    // ── Handlers ─────────────────────────────────────────────────

    #[tokio::test]
    async fn start_command_sends_pitch_and_buy_button() {
        let h = harness(Some("admin"));
        h.bot.handle_event(command("u1", "start")).await;

        let sent = h.transport.sent();
        assert!(matches!(&sent[0], Sent::Text { to, text } if to == "u1" && text.contains("R$ 9.90")));
        assert!(sent.iter().any(
            |s| matches!(s, Sent::Choices { to, actions } if to == "u1" && actions == &vec![ACTION_BUY.to_string()])
        ));
        // Operator got the lead event
        assert!(h
            .transport
            .texts_to("admin")
            .iter()
            .any(|t| t.contains("BOT INICIADO")));
    }

    #[tokio::test]
    async fn help_command_offers_check() {
        let h = harness(None);
        h.bot.handle_event(command("u1", "help")).await;

        assert!(h.transport.sent().iter().any(
            |s| matches!(s, Sent::Choices { actions, .. } if actions == &vec![ACTION_CHECK.to_string()])
        ));
    }

    #[tokio::test]
    async fn unknown_commands_are_ignored() {
        let h = harness(None);
        h.bot.handle_event(command("u1", "unknown")).await;
        h.bot.handle_event(action("u1", "mystery")).await;
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn buy_action_starts_purchase_and_offers_check() {
        let h = harness(None);
        h.bot.handle_event(action("u1", ACTION_BUY)).await;

        let texts = h.transport.texts_to("u1");
        assert_eq!(texts[0], GENERATING);
        assert!(h.transport.sent().iter().any(
            |s| matches!(s, Sent::Choices { actions, .. } if actions == &vec![ACTION_CHECK.to_string()])
        ));
    }

    #[tokio::test]
    async fn check_while_pending_tells_buyer_to_wait() {
        let h = harness(Some("admin"));
        h.bot.handle_event(action("u1", ACTION_BUY)).await;
        h.bot.handle_event(action("u1", ACTION_CHECK)).await;

        assert!(h.transport.texts_to("u1").contains(&WAIT.to_string()));
        assert!(h
            .transport
            .texts_to("admin")
            .iter()
            .any(|t| t.contains("COMPRA NÃO EFETUADA")));
    }

    #[tokio::test]
    async fn check_after_payment_delivers_access() {
        let h = harness(Some("admin"));
        h.bot.handle_event(action("u1", ACTION_BUY)).await;
        *h.gateway.status.lock() = SettlementStatus::Paid;
        h.bot.handle_event(action("u1", ACTION_CHECK)).await;

        let texts = h.transport.texts_to("u1");
        assert!(texts.contains(&APPROVED.to_string()));
        assert!(texts.iter().any(|t| t.contains("https://t.me/+vip")));
        assert!(texts.contains(&THANKS.to_string()));
        assert!(h
            .transport
            .texts_to("admin")
            .iter()
            .any(|t| t.contains("COMPRA EFETUADA")));
    }

    #[tokio::test]
    async fn check_without_purchase_points_to_start() {
        let h = harness(None);
        h.bot.handle_event(action("u1", ACTION_CHECK)).await;
        assert!(h.transport.texts_to("u1").contains(&NO_ORDER.to_string()));
    }

    #[tokio::test]
    async fn reminder_sink_sends_pending_nudge() {
        let h = harness(None);
        h.bot
            .deliver("u1", "or_1", ReminderKind::PaymentPending)
            .await
            .unwrap();
        assert!(h.transport.texts_to("u1").contains(&PENDING_NUDGE.to_string()));
    }

    #[tokio::test]
    async fn reminder_sink_sends_discount_offer_with_button() {
        let h = harness(None);
        h.bot.handle_event(action("u1", ACTION_BUY)).await;
        let order_id = "or_1";

        h.bot
            .deliver("u1", order_id, ReminderKind::DiscountOffer)
            .await
            .unwrap();

        assert!(h
            .transport
            .texts_to("u1")
            .iter()
            .any(|t| t.contains("R$ 6.99")));
        assert!(h.transport.sent().iter().any(
            |s| matches!(s, Sent::Choices { actions, .. } if actions == &vec![ACTION_REMARKET.to_string()])
        ));
    }

    #[tokio::test]
    async fn remarket_action_uses_discount_stage() {
        let h = harness(None);
        h.bot.handle_event(action("u1", ACTION_BUY)).await;
        h.bot.handle_event(action("u1", ACTION_REMARKET)).await;

        // Two intents were created; the funnel keeps running on the second
        let texts = h.transport.texts_to("u1");
        assert_eq!(texts.iter().filter(|t| *t == GENERATING).count(), 2);
    }
}
