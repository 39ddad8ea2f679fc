//! Hourly expiration sweep.
//!
//! One global timer scans every expiration record: reminders at three
//! days and one day before expiry (each at most once per window), and a
//! terminal branch at zero — auto-renew from balance when it covers a
//! month, revoke otherwise. The timer is replaced, never stacked; the
//! change-feed listener restarts it whenever the deadline set shifts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use portaria_shared::{format_brl, format_date_br, ChannelId, MemberId, Plan};

use crate::context::EngineContext;
use crate::directory::{channel_slug, Member, NewChannel};
use crate::error::{MembershipError, MembershipResult};
use crate::plan::days_left;
use crate::store::ReminderKind;
use crate::teardown::ScheduledTeardowns;

/// Private notice channels live this long before teardown.
const NOTICE_CHANNEL_TTL: Duration = Duration::from_secs(12 * 3_600);

pub struct ExpirationSweeper {
    ctx: EngineContext,
    teardowns: Arc<ScheduledTeardowns>,
    period: Duration,
    initial_delay: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationSweeper {
    pub fn new(
        ctx: EngineContext,
        teardowns: Arc<ScheduledTeardowns>,
        period: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            ctx,
            teardowns,
            period,
            initial_delay,
            timer: Mutex::new(None),
        }
    }

    /// Cancels any running timer, then installs a fresh delayed-start
    /// loop. At most one timer is live at any instant. Each pass runs as
    /// its own task so cancelling the schedule never cuts a pass short
    /// mid-record.
    pub fn restart(self: &Arc<Self>) {
        let mut slot = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let sweeper = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(sweeper.initial_delay).await;
            loop {
                let pass = Arc::clone(&sweeper);
                tokio::spawn(async move { pass.sweep().await });
                tokio::time::sleep(sweeper.period).await;
            }
        }));
    }

    /// Whether a timer loop is currently installed.
    pub fn is_scheduled(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One pass over every record. Failures are isolated per record; one
    /// bad row never blocks the rest of the sweep.
    pub async fn sweep(&self) {
        let now = OffsetDateTime::now_utc();
        let records = match self.ctx.expirations.all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Expiration scan failed");
                return;
            }
        };
        info!(records = records.len(), "Expiration sweep started");
        for record in records {
            if let Err(e) = self.process(&record.member, record.expires_at, now).await {
                warn!(member = record.member.as_str(), error = %e, "Expiration processing failed");
            }
        }
    }

    async fn process(
        &self,
        member_id: &MemberId,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MembershipResult<()> {
        let remaining = days_left(expires_at, now);
        if remaining > 3 {
            return Ok(());
        }
        let member = match self.ctx.directory.fetch_member(member_id).await {
            Ok(member) => member,
            Err(MembershipError::MemberNotFound(_)) => {
                // Already departed: drop the record, nothing to notify.
                info!(member = member_id.as_str(), "Departed member purged from expirations");
                self.ctx.expirations.delete(member_id).await?;
                self.ctx.expirations.clear_notifications(member_id).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match remaining {
            3 => self.send_reminder(&member, ReminderKind::ThreeDays, now).await,
            1 => self.send_reminder(&member, ReminderKind::OneDay, now).await,
            r if r <= 0 => self.handle_expired(&member, now).await,
            _ => Ok(()),
        }
    }

    /// Reminder in a private channel, recorded only after the message is
    /// out so a failed attempt is retried next sweep.
    async fn send_reminder(
        &self,
        member: &Member,
        kind: ReminderKind,
        now: OffsetDateTime,
    ) -> MembershipResult<()> {
        if self.ctx.expirations.was_notified(&member.id, kind).await? {
            return Ok(());
        }
        let (window, suffix) = match kind {
            ReminderKind::ThreeDays => ("3 dias", "3dias"),
            ReminderKind::OneDay => ("1 dia", "1dia"),
        };
        let channel = self
            .notice_channel(member, &format!("expiracao-{}-{}", channel_slug(&member.username), suffix))
            .await?;
        self.ctx
            .directory
            .send_channel_message(
                channel,
                &format!(
                    "⚠️ | Olá <@{}>! Sua assinatura expira em {window}. Renove para não perder o acesso.",
                    member.id
                ),
            )
            .await?;
        self.ctx
            .expirations
            .record_notification(&member.id, kind, now)
            .await?;
        self.teardowns.schedule(channel, NOTICE_CHANNEL_TTL);
        self.ctx.audit().subscription_reminder(&member.id, kind).await;
        Ok(())
    }

    async fn handle_expired(&self, member: &Member, now: OffsetDateTime) -> MembershipResult<()> {
        let balance = self.ctx.balances.balance(&member.id).await?;
        if balance >= Plan::Monthly.price_cents() {
            self.auto_renew(member, now).await
        } else {
            self.revoke(member).await
        }
    }

    /// The balance covers a month: push the window to now + 30 days,
    /// then debit exactly the monthly price. Role sync arrives through
    /// the listener's reaction to the update.
    ///
    /// The extension lands before the debit: a store failure in between
    /// must never leave the member charged without access.
    async fn auto_renew(&self, member: &Member, now: OffsetDateTime) -> MembershipResult<()> {
        let monthly = Plan::Monthly.price_cents();
        let new_expiry = now + time::Duration::days(Plan::Monthly.days());
        self.ctx.expirations.upsert(&member.id, new_expiry).await?;
        self.ctx.expirations.clear_notifications(&member.id).await?;
        self.ctx.balances.adjust(&member.id, -monthly).await?;
        info!(member = member.id.as_str(), "Subscription auto-renewed from balance");
        if let Err(e) = self
            .ctx
            .directory
            .send_dm(
                &member.id,
                &format!(
                    "🔄 | Sua assinatura foi renovada automaticamente com {} do seu saldo. Novo vencimento: {}.",
                    format_brl(monthly),
                    format_date_br(new_expiry)
                ),
            )
            .await
        {
            warn!(member = member.id.as_str(), error = %e, "Auto-renewal DM failed");
        }
        self.ctx.audit().auto_renewed(&member.id, new_expiry).await;
        Ok(())
    }

    /// No funds: swap the entitlement pair, tell the member, then drop
    /// the record so the member returns to "no known entitlement".
    async fn revoke(&self, member: &Member) -> MembershipResult<()> {
        let report = self.ctx.roles().sync_entitlement(&member.id, false).await?;
        if !report.fully_applied() {
            warn!(member = member.id.as_str(), "Entitlement revocation partially applied");
        }
        // Notice failures never block the removal itself.
        if let Err(e) = self.expired_notice(member).await {
            warn!(member = member.id.as_str(), error = %e, "Expiration notice failed");
        }
        self.ctx.audit().subscription_expired(&member.id).await;
        self.ctx.expirations.delete(&member.id).await?;
        self.ctx.expirations.clear_notifications(&member.id).await?;
        Ok(())
    }

    async fn expired_notice(&self, member: &Member) -> MembershipResult<()> {
        let channel = self
            .notice_channel(
                member,
                &format!("expiracao-{}-expirada", channel_slug(&member.username)),
            )
            .await?;
        self.ctx
            .directory
            .send_channel_message(
                channel,
                &format!(
                    "🚫 | <@{}>, sua assinatura expirou e o acesso foi suspenso. Faça um novo pagamento para voltar a ter acesso.",
                    member.id
                ),
            )
            .await?;
        self.teardowns.schedule(channel, NOTICE_CHANNEL_TTL);
        Ok(())
    }

    /// Reuses an existing channel of the same name instead of stacking
    /// duplicates.
    async fn notice_channel(&self, member: &Member, name: &str) -> MembershipResult<ChannelId> {
        if let Some(existing) = self.ctx.directory.find_text_channel(name).await? {
            return Ok(existing);
        }
        self.ctx
            .directory
            .create_private_channel(&NewChannel {
                name: name.to_string(),
                category: self.ctx.guild.channels.expirations_category,
                member: member.id.clone(),
            })
            .await
    }
}
