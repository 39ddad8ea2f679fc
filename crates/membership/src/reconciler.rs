//! Payment webhook reconciliation: one approved gateway payment becomes
//! one entitlement extension, exactly once per payment reference.
//!
//! The transport ack happens in the HTTP layer before this runs; from
//! here on, everything is caught and logged at the top. The gateway's
//! own webhook redelivery is the retry mechanism, and the reference
//! check makes redelivery safe.

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use portaria_shared::{format_brl, format_date_br, MemberId, Plan, REFERRAL_BONUS_CENTS};

use crate::context::EngineContext;
use crate::error::MembershipResult;
use crate::gateway::PaymentStatus;
use crate::plan::{duration_days, extension_base};
use crate::store::{PaymentEntry, RegisteredUser};

pub struct PaymentReconciler {
    ctx: EngineContext,
}

impl PaymentReconciler {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Entry point from the webhook route. Never fails outward: the
    /// gateway already got its ack.
    pub async fn process(&self, payment_id: i64) {
        if let Err(e) = self.try_process(payment_id).await {
            warn!(payment = payment_id, error = %e, "Payment reconciliation failed");
        }
    }

    async fn try_process(&self, payment_id: i64) -> MembershipResult<()> {
        let details = self.ctx.gateway.fetch_payment(payment_id).await?;
        if details.status != PaymentStatus::Approved {
            debug!(payment = payment_id, status = ?details.status, "Ignoring non-approved payment");
            return Ok(());
        }
        let Some(payer) = details.payer.clone() else {
            warn!(payment = payment_id, "Approved payment without a payer reference");
            return Ok(());
        };

        // The sole de-duplication gate; checked before any mutation.
        let reference = details.reference();
        if self.ctx.registry.has_reference(&payer, &reference).await? {
            info!(payment = payment_id, member = payer.as_str(), "Duplicate delivery discarded");
            return Ok(());
        }
        let Some(registration) = self.ctx.registry.find(&payer).await? else {
            warn!(member = payer.as_str(), "Payment from an unregistered member");
            return Ok(());
        };
        if let Err(e) = self.ctx.directory.fetch_member(&payer).await {
            warn!(member = payer.as_str(), error = %e, "Payer not resolvable in the directory");
            return Ok(());
        }
        let now = OffsetDateTime::now_utc();

        // Eligibility reads the pre-append history, so the reference
        // gate above also covers the bonus.
        self.maybe_pay_referral_bonus(&registration, details.amount_cents)
            .await;

        let days = duration_days(details.amount_cents, details.balance_offset_cents);
        let existing = self.ctx.expirations.find(&payer).await?;
        let base = extension_base(existing.map(|r| r.expires_at), now);
        let new_expiry = base + time::Duration::days(days);
        self.ctx.expirations.upsert(&payer, new_expiry).await?;
        self.ctx
            .registry
            .append_payment(
                &payer,
                &PaymentEntry {
                    amount_cents: details.amount_cents,
                    paid_at: now,
                    reference,
                },
            )
            .await?;

        // The listener reacts to the upsert too, but it may be down.
        match self.ctx.roles().sync_entitlement(&payer, true).await {
            Ok(report) if !report.fully_applied() => {
                warn!(member = payer.as_str(), "Entitlement grant partially applied");
            }
            Ok(_) => {}
            Err(e) => warn!(member = payer.as_str(), error = %e, "Entitlement grant failed"),
        }

        if details.balance_offset_cents > 0 {
            self.ctx
                .balances
                .adjust(&payer, -details.balance_offset_cents)
                .await?;
            self.ctx
                .audit()
                .balance_applied(&payer, details.balance_offset_cents, new_expiry)
                .await;
        } else {
            self.ctx.audit().subscription_renewed(&payer, new_expiry).await;
        }

        self.deliver_confirmation(&payer, details.amount_cents, days, new_expiry)
            .await;
        self.ctx
            .audit()
            .payment_approved(&payer, details.amount_cents, days)
            .await;
        info!(payment = payment_id, member = payer.as_str(), days, "Payment reconciled");
        Ok(())
    }

    /// Fixed bonus to the referrer, once, on the referred member's first
    /// full-price monthly payment. Failures here never block the payment
    /// itself.
    async fn maybe_pay_referral_bonus(&self, registration: &RegisteredUser, amount_cents: i64) {
        if amount_cents != Plan::Monthly.price_cents() {
            return;
        }
        let Some(referrer) = registration.referred_by.clone() else {
            return;
        };
        if registration.referral_bonus_paid {
            return;
        }
        let history = match self.ctx.registry.payment_history(&registration.member).await {
            Ok(history) => history,
            Err(e) => {
                warn!(member = registration.member.as_str(), error = %e, "History lookup for bonus failed");
                return;
            }
        };
        if !history.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.balances.adjust(&referrer, REFERRAL_BONUS_CENTS).await {
            warn!(referrer = referrer.as_str(), error = %e, "Referral bonus credit failed");
            return;
        }
        if let Err(e) = self
            .ctx
            .registry
            .set_referral_bonus_paid(&registration.member)
            .await
        {
            warn!(member = registration.member.as_str(), error = %e, "Bonus flag update failed");
        }
        info!(
            referrer = referrer.as_str(),
            referred = registration.member.as_str(),
            "Referral bonus credited"
        );
        if let Err(e) = self
            .ctx
            .directory
            .send_dm(
                &referrer,
                &format!(
                    "💰 | Você recebeu {} de bônus porque sua indicação assinou o plano mensal!",
                    format_brl(REFERRAL_BONUS_CENTS)
                ),
            )
            .await
        {
            warn!(referrer = referrer.as_str(), error = %e, "Referral bonus DM failed");
        }
        self.ctx
            .audit()
            .referral_bonus(&referrer, &registration.member)
            .await;
    }

    /// Channel first while the payment session is live; the session is
    /// cleared only after the channel message lands. A dead channel
    /// falls back to DM and leaves the session for the stale reaper.
    async fn deliver_confirmation(
        &self,
        member: &MemberId,
        amount_cents: i64,
        days: i64,
        new_expiry: OffsetDateTime,
    ) {
        let text = format!(
            "✅ | Pagamento de {} aprovado! Seu acesso foi liberado por {days} dias, válido até {}.",
            format_brl(amount_cents),
            format_date_br(new_expiry)
        );
        let session = match self.ctx.sessions.find(member).await {
            Ok(session) => session,
            Err(e) => {
                warn!(member = member.as_str(), error = %e, "Session lookup failed");
                None
            }
        };
        if let Some(session) = session {
            match self
                .ctx
                .directory
                .send_channel_message(session.channel, &text)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.ctx.sessions.delete(member).await {
                        warn!(member = member.as_str(), error = %e, "Session cleanup failed");
                    }
                    return;
                }
                Err(e) => {
                    warn!(member = member.as_str(), error = %e, "Confirmation channel send failed, falling back to DM");
                }
            }
        }
        if let Err(e) = self.ctx.directory.send_dm(member, &text).await {
            warn!(member = member.as_str(), error = %e, "Confirmation DM failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaymentDetails;
    use crate::store::{
        BalanceStore, ExpirationStore, MemberRegistry, PaymentSession, SessionStore,
    };
    use crate::testkit::{
        guild_member, harness, registration, TestHarness, AWAITING, BOT_LOG, COUPONS_LOG,
        PAYMENTS_LOG, VIP,
    };
    use portaria_shared::ChannelId;

    fn id(raw: &str) -> MemberId {
        MemberId::new(raw)
    }

    fn reconciler(h: &TestHarness) -> PaymentReconciler {
        PaymentReconciler::new(h.ctx.clone())
    }

    async fn seed_registered_member(h: &TestHarness, raw: &str) {
        h.directory.insert_member(guild_member(raw, vec![AWAITING]));
        h.store.insert(&registration(raw)).await.unwrap();
    }

    fn approved(id: i64, payer: &str, amount_cents: i64, offset_cents: i64) -> PaymentDetails {
        PaymentDetails {
            id,
            status: PaymentStatus::Approved,
            payer: Some(MemberId::new(payer)),
            amount_cents,
            balance_offset_cents: offset_cents,
        }
    }

    #[tokio::test]
    async fn monthly_payment_grants_thirty_days() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        h.gateway.seed_payment(approved(555, "42", 30_000, 0));
        let now = OffsetDateTime::now_utc();

        reconciler(&h).process(555).await;

        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert!(record.expires_at > now + time::Duration::days(29));
        assert!(record.expires_at < now + time::Duration::days(31));
        let history = h.store.payment_history(&id("42")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reference, "MP-555");
        assert_eq!(history[0].amount_cents, 30_000);
        let member = h.directory.member(&id("42")).unwrap();
        assert!(member.has_role(VIP));
        assert!(!member.has_role(AWAITING));
        assert_eq!(h.directory.channel_messages(PAYMENTS_LOG).len(), 1);
        assert_eq!(h.directory.channel_messages(BOT_LOG).len(), 1);
        let dms = h.directory.dms_to(&id("42"));
        assert_eq!(dms.len(), 1);
        assert!(dms[0].contains("R$ 300,00"));
    }

    #[tokio::test]
    async fn duplicate_delivery_changes_nothing() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        h.gateway.seed_payment(approved(555, "42", 30_000, 0));
        let reconciler = reconciler(&h);

        reconciler.process(555).await;
        let after_first = h.store.find(&id("42")).await.unwrap().unwrap();

        reconciler.process(555).await;

        let after_second = h.store.find(&id("42")).await.unwrap().unwrap();
        assert_eq!(after_first.expires_at, after_second.expires_at);
        assert_eq!(h.store.payment_history(&id("42")).await.unwrap().len(), 1);
        assert_eq!(h.directory.channel_messages(PAYMENTS_LOG).len(), 1);
    }

    #[tokio::test]
    async fn weekly_amount_grants_seven_days() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        h.gateway.seed_payment(approved(556, "42", 10_000, 0));
        let now = OffsetDateTime::now_utc();

        reconciler(&h).process(556).await;

        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert!(record.expires_at > now + time::Duration::days(6));
        assert!(record.expires_at < now + time::Duration::days(8));
    }

    #[tokio::test]
    async fn renewal_extends_from_the_current_expiry() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        let now = OffsetDateTime::now_utc();
        h.store
            .upsert(&id("42"), now + time::Duration::days(10))
            .await
            .unwrap();
        h.gateway.seed_payment(approved(557, "42", 30_000, 0));

        reconciler(&h).process(557).await;

        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert!(record.expires_at > now + time::Duration::days(39));
        assert!(record.expires_at < now + time::Duration::days(41));
    }

    #[tokio::test]
    async fn lapsed_record_extends_from_now_not_the_past() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        let now = OffsetDateTime::now_utc();
        h.store
            .upsert(&id("42"), now - time::Duration::days(5))
            .await
            .unwrap();
        h.gateway.seed_payment(approved(558, "42", 30_000, 0));

        reconciler(&h).process(558).await;

        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert!(record.expires_at > now + time::Duration::days(29));
        assert!(record.expires_at < now + time::Duration::days(31));
    }

    #[tokio::test]
    async fn referral_bonus_is_single_shot() {
        let h = harness();
        seed_registered_member(&h, "7").await;
        seed_registered_member(&h, "42").await;
        h.store.set_referred_by(&id("42"), &id("7")).await.unwrap();
        h.gateway.seed_payment(approved(600, "42", 30_000, 0));
        let reconciler = reconciler(&h);

        reconciler.process(600).await;

        assert_eq!(h.store.balance(&id("7")).await.unwrap(), 5_000);
        let registered = h.store.find_user(&id("42")).await;
        assert!(registered.referral_bonus_paid);
        assert_eq!(h.directory.channel_messages(COUPONS_LOG).len(), 1);
        assert_eq!(h.directory.dms_to(&id("7")).len(), 1);

        h.gateway.seed_payment(approved(601, "42", 30_000, 0));
        reconciler.process(601).await;

        assert_eq!(h.store.balance(&id("7")).await.unwrap(), 5_000);
        assert_eq!(h.directory.channel_messages(COUPONS_LOG).len(), 1);
    }

    #[tokio::test]
    async fn weekly_payment_pays_no_bonus() {
        let h = harness();
        seed_registered_member(&h, "7").await;
        seed_registered_member(&h, "42").await;
        h.store.set_referred_by(&id("42"), &id("7")).await.unwrap();
        h.gateway.seed_payment(approved(602, "42", 10_000, 0));

        reconciler(&h).process(602).await;

        assert_eq!(h.store.balance(&id("7")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prior_history_blocks_the_bonus() {
        let h = harness();
        seed_registered_member(&h, "7").await;
        seed_registered_member(&h, "42").await;
        h.store.set_referred_by(&id("42"), &id("7")).await.unwrap();
        h.store
            .append_payment(
                &id("42"),
                &PaymentEntry {
                    amount_cents: 10_000,
                    paid_at: OffsetDateTime::now_utc() - time::Duration::days(40),
                    reference: "MP-1".to_string(),
                },
            )
            .await
            .unwrap();
        h.gateway.seed_payment(approved(603, "42", 30_000, 0));

        reconciler(&h).process(603).await;

        assert_eq!(h.store.balance(&id("7")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn declared_offset_is_debited_and_logged_distinctly() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        h.store.adjust(&id("42"), 5_000).await.unwrap();
        h.gateway.seed_payment(approved(604, "42", 25_000, 5_000));
        let now = OffsetDateTime::now_utc();

        reconciler(&h).process(604).await;

        assert_eq!(h.store.balance(&id("42")).await.unwrap(), 0);
        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert!(record.expires_at > now + time::Duration::days(29));
        let bot_log = h.directory.channel_messages(BOT_LOG);
        assert_eq!(bot_log.len(), 1);
        assert!(bot_log[0].contains("saldo"));
        assert!(bot_log[0].contains("R$ 50,00"));
    }

    #[tokio::test]
    async fn offset_summing_to_weekly_grants_seven_days() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        h.store.adjust(&id("42"), 8_000).await.unwrap();
        h.gateway.seed_payment(approved(605, "42", 2_000, 8_000));
        let now = OffsetDateTime::now_utc();

        reconciler(&h).process(605).await;

        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert!(record.expires_at < now + time::Duration::days(8));
        assert_eq!(h.store.balance(&id("42")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unregistered_payer_causes_no_mutation() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        h.gateway.seed_payment(approved(606, "42", 30_000, 0));

        reconciler(&h).process(606).await;

        assert!(h.store.find(&id("42")).await.unwrap().is_none());
        assert!(h.directory.channel_messages(PAYMENTS_LOG).is_empty());
    }

    #[tokio::test]
    async fn departed_payer_causes_no_mutation() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        h.gateway.seed_payment(approved(607, "42", 30_000, 0));

        reconciler(&h).process(607).await;

        assert!(h.store.find(&id("42")).await.unwrap().is_none());
        assert!(h.store.payment_history(&id("42")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_payment_is_ignored() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        h.gateway.seed_payment(PaymentDetails {
            id: 608,
            status: PaymentStatus::Pending,
            payer: Some(id("42")),
            amount_cents: 30_000,
            balance_offset_cents: 0,
        });

        reconciler(&h).process(608).await;

        assert!(h.store.find(&id("42")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirmation_prefers_the_session_channel() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        let channel = ChannelId(7_777);
        h.store
            .put(&PaymentSession {
                member: id("42"),
                channel,
                amount_cents: 30_000,
                balance_offset_cents: 0,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        h.gateway.seed_payment(approved(609, "42", 30_000, 0));

        reconciler(&h).process(609).await;

        let sent = h.directory.channel_messages(channel);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("aprovado"));
        assert!(h.directory.dms_to(&id("42")).is_empty());
        assert!(h.store.session_for(&id("42")).await.is_none());
    }

    #[tokio::test]
    async fn dead_session_channel_falls_back_to_dm_and_keeps_the_session() {
        let h = harness();
        seed_registered_member(&h, "42").await;
        let channel = ChannelId(7_777);
        h.directory.fail_sends_to(channel);
        h.store
            .put(&PaymentSession {
                member: id("42"),
                channel,
                amount_cents: 30_000,
                balance_offset_cents: 0,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        h.gateway.seed_payment(approved(610, "42", 30_000, 0));

        reconciler(&h).process(610).await;

        assert_eq!(h.directory.dms_to(&id("42")).len(), 1);
        assert!(h.store.session_for(&id("42")).await.is_some());
    }
}
