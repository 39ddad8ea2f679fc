//! Guild-facing audit and notice messages.
//!
//! Every event the engine wants a human to see goes through here:
//! public notices, payment and coupon logs, removal and contact logs.
//! Sends are best effort. A missing or broken channel downgrades to a
//! warning; notices never fail the flow that produced them.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::warn;

use portaria_shared::{format_brl, format_date_br, ChannelConfig, ChannelId, MemberId};

use crate::directory::Directory;
use crate::store::ReminderKind;

#[derive(Clone)]
pub struct AuditLog {
    directory: Arc<dyn Directory>,
    channels: ChannelConfig,
}

impl AuditLog {
    pub fn new(directory: Arc<dyn Directory>, channels: ChannelConfig) -> Self {
        Self { directory, channels }
    }

    async fn post(&self, channel: ChannelId, content: String) {
        if let Err(e) = self.directory.send_channel_message(channel, &content).await {
            warn!(channel = channel.0, error = %e, "Audit notice failed");
        }
    }

    pub async fn subscription_reminder(&self, member: &MemberId, kind: ReminderKind) {
        let window = match kind {
            ReminderKind::ThreeDays => "3 dias",
            ReminderKind::OneDay => "1 dia",
        };
        self.post(
            self.channels.notices,
            format!("⚠️ | A assinatura de <@{member}> expira em {window}!"),
        )
        .await;
    }

    pub async fn subscription_expired(&self, member: &MemberId) {
        self.post(
            self.channels.notices,
            format!("🚫 | A assinatura de <@{member}> expirou!"),
        )
        .await;
    }

    pub async fn auto_renewed(&self, member: &MemberId, new_expiry: OffsetDateTime) {
        self.post(
            self.channels.bot_log,
            format!(
                "🔄 | Assinatura de <@{member}> renovada automaticamente com saldo. Novo vencimento: {}.",
                format_date_br(new_expiry)
            ),
        )
        .await;
    }

    pub async fn subscription_renewed(&self, member: &MemberId, new_expiry: OffsetDateTime) {
        self.post(
            self.channels.bot_log,
            format!(
                "📅 | Assinatura de <@{member}> renovada. Novo vencimento: {}.",
                format_date_br(new_expiry)
            ),
        )
        .await;
    }

    pub async fn balance_applied(
        &self,
        member: &MemberId,
        offset_cents: i64,
        new_expiry: OffsetDateTime,
    ) {
        self.post(
            self.channels.bot_log,
            format!(
                "💳 | Assinatura de <@{member}> renovada com {} de saldo aplicado. Novo vencimento: {}.",
                format_brl(offset_cents),
                format_date_br(new_expiry)
            ),
        )
        .await;
    }

    pub async fn payment_approved(&self, member: &MemberId, amount_cents: i64, duration_days: i64) {
        self.post(
            self.channels.payments_log,
            format!(
                "✅ | Pagamento aprovado: <@{member}> — {} ({} dias de acesso).",
                format_brl(amount_cents),
                duration_days
            ),
        )
        .await;
    }

    pub async fn referral_bonus(&self, referrer: &MemberId, referred: &MemberId) {
        self.post(
            self.channels.coupons_log,
            format!(
                "💰 | <@{referrer}> recebeu {} de bônus pela indicação de <@{referred}>.",
                format_brl(portaria_shared::REFERRAL_BONUS_CENTS)
            ),
        )
        .await;
    }

    pub async fn referral_linked(&self, member: &MemberId, referrer: &MemberId) {
        self.post(
            self.channels.coupons_log,
            format!("🔗 | <@{member}> entrou por indicação de <@{referrer}>."),
        )
        .await;
    }

    pub async fn indication_recorded(&self, member: &MemberId, tag: &str) {
        self.post(
            self.channels.coupons_log,
            format!("🏷️ | <@{member}> chegou via `{tag}`."),
        )
        .await;
    }

    pub async fn coupon_redeemed(&self, member: &MemberId, coupon: &str, bonus_days: i64) {
        self.post(
            self.channels.coupons_log,
            format!("🎟️ | <@{member}> resgatou o cupom `{coupon}` (+{bonus_days} dias)."),
        )
        .await;
    }

    pub async fn registration_removed(&self, member: &MemberId) {
        self.post(
            self.channels.removals_log,
            format!("📤 | Registro de <@{member}> removido. Cargos e assinatura revogados."),
        )
        .await;
    }

    pub async fn subscription_removed(&self, member: &MemberId) {
        self.post(
            self.channels.removals_log,
            format!("🗑️ | Assinatura de <@{member}> removida fora do ciclo. Acesso revogado."),
        )
        .await;
    }

    pub async fn contact_registered(&self, member: &MemberId, name: &str, contact: &str) {
        self.post(
            self.channels.contact_log,
            format!("📇 | Registro de <@{member}> — nome: {name}, contato: {contact}."),
        )
        .await;
    }
}
