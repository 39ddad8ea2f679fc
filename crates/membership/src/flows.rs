//! Panel flows: registration, coupon/referral redemption, payment
//! requests, and the account summary.
//!
//! These are the member-initiated entry points; the HTTP layer stays a
//! thin shell over them. Validation errors come back as typed
//! [`MembershipError`] values and never mutate state.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use portaria_shared::{format_brl, ChannelId, MemberId, COUPON_BONUS_DAYS};

use crate::context::EngineContext;
use crate::directory::{channel_slug, NewChannel};
use crate::error::{MembershipError, MembershipResult};
use crate::gateway::{NewPayment, PixCharge};
use crate::plan::{days_left, extension_base, PaymentQuote};
use crate::store::{PaymentEntry, PaymentSession, RegisteredUser};
use crate::teardown::ScheduledTeardowns;

/// The one promotional coupon currently live.
const BONUS_COUPON: &str = "CUPOM";

/// Accepted indication tags, matched case-insensitively.
const INDICATION_TAGS: [&str; 3] = ["INSTAGRAM", "YOUTUBE", "TIKTOK"];

/// What a redeemed code turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// A referral id was linked; the referrer gets their bonus on the
    /// redeemer's first monthly payment.
    ReferralLinked { referrer: MemberId },
    /// The bonus coupon extended the subscription window.
    BonusDays { new_expiry: OffsetDateTime },
    /// An indication tag was recorded on the registration.
    IndicationTagged { tag: String },
}

/// Subscription state as shown on the account panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active {
        expires_at: OffsetDateTime,
        days_left: i64,
    },
    Expired {
        expires_at: OffsetDateTime,
    },
    None,
}

#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub member: MemberId,
    pub name: String,
    pub contact: String,
    pub registered_at: OffsetDateTime,
    pub balance_cents: i64,
    pub last_payment: Option<PaymentEntry>,
    pub status: SubscriptionStatus,
}

pub struct PanelFlows {
    ctx: EngineContext,
    teardowns: Arc<ScheduledTeardowns>,
}

impl PanelFlows {
    pub fn new(ctx: EngineContext, teardowns: Arc<ScheduledTeardowns>) -> Self {
        Self { ctx, teardowns }
    }

    /// Register a guild member: identity row, zero balance, registered
    /// role, contact-log notice. Rejects malformed phones and duplicate
    /// registrations before touching anything.
    pub async fn register(
        &self,
        member_id: &MemberId,
        name: &str,
        contact: &str,
        now: OffsetDateTime,
    ) -> MembershipResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MembershipError::InvalidInput("name must not be empty".to_string()));
        }
        if !valid_mobile(contact) {
            return Err(MembershipError::InvalidInput(format!(
                "{contact:?} is not an 11-digit mobile number (DDD + 9XXXXXXXX)"
            )));
        }
        let member = self.ctx.directory.fetch_member(member_id).await?;

        self.ctx
            .registry
            .insert(&RegisteredUser {
                member: member_id.clone(),
                name: name.to_string(),
                contact: contact.to_string(),
                registered_at: now,
                referred_by: None,
                referral_bonus_paid: false,
                indication: None,
            })
            .await?;
        self.ctx.balances.initialize(member_id).await?;

        match self.ctx.roles().assign_registered(&member).await {
            Ok(outcome) if !outcome.applied() => {
                warn!(member = member_id.as_str(), ?outcome, "Registered role not granted");
            }
            Ok(_) => {}
            Err(e) => warn!(member = member_id.as_str(), error = %e, "Registered role grant failed"),
        }
        self.ctx.audit().contact_registered(member_id, name, contact).await;
        info!(member = member_id.as_str(), "Member registered");
        Ok(())
    }

    /// Redeem a code: a referral id (17-20 digit snowflake), the bonus
    /// coupon, or an indication tag. Anything else is rejected.
    pub async fn redeem(
        &self,
        member_id: &MemberId,
        code: &str,
        now: OffsetDateTime,
    ) -> MembershipResult<RedeemOutcome> {
        let code = code.trim();
        if self.ctx.registry.find(member_id).await?.is_none() {
            return Err(MembershipError::NotRegistered(member_id.to_string()));
        }

        if looks_like_member_id(code) {
            return self.link_referral(member_id, &MemberId::new(code)).await;
        }
        if code.eq_ignore_ascii_case(BONUS_COUPON) {
            return self.redeem_bonus_coupon(member_id, now).await;
        }
        if let Some(tag) = INDICATION_TAGS
            .iter()
            .find(|t| code.eq_ignore_ascii_case(t))
        {
            return self.record_indication(member_id, tag, now).await;
        }
        Err(MembershipError::InvalidCoupon(code.to_string()))
    }

    /// Link a referrer to a fresh account. Only accounts with no payment
    /// history can be referred, and only by members who have paid at
    /// least once themselves.
    async fn link_referral(
        &self,
        member_id: &MemberId,
        referrer: &MemberId,
    ) -> MembershipResult<RedeemOutcome> {
        if referrer == member_id {
            return Err(MembershipError::InvalidCoupon(
                "self-referral is not allowed".to_string(),
            ));
        }
        let Some(registration) = self.ctx.registry.find(member_id).await? else {
            return Err(MembershipError::NotRegistered(member_id.to_string()));
        };
        if registration.referred_by.is_some() {
            return Err(MembershipError::CouponAlreadyUsed(
                "a referrer is already linked".to_string(),
            ));
        }
        if !self.ctx.registry.payment_history(member_id).await?.is_empty() {
            return Err(MembershipError::AlreadySubscribed(member_id.to_string()));
        }
        if self.ctx.registry.find(referrer).await?.is_none() {
            return Err(MembershipError::InvalidCoupon(format!(
                "referrer {referrer} is not registered"
            )));
        }
        if self.ctx.registry.payment_history(referrer).await?.is_empty() {
            return Err(MembershipError::InvalidCoupon(format!(
                "referrer {referrer} has no completed payment"
            )));
        }

        self.ctx.registry.set_referred_by(member_id, referrer).await?;
        self.ctx.audit().referral_linked(member_id, referrer).await;
        info!(
            member = member_id.as_str(),
            referrer = referrer.as_str(),
            "Referral linked"
        );
        Ok(RedeemOutcome::ReferralLinked {
            referrer: referrer.clone(),
        })
    }

    /// The bonus coupon grants fixed extra days, once per member, on top
    /// of the current window. No payment-history entry is written; the
    /// coupon path must never look like a payment.
    async fn redeem_bonus_coupon(
        &self,
        member_id: &MemberId,
        now: OffsetDateTime,
    ) -> MembershipResult<RedeemOutcome> {
        if self.ctx.registry.coupon_used(member_id, BONUS_COUPON).await? {
            return Err(MembershipError::CouponAlreadyUsed(BONUS_COUPON.to_string()));
        }
        let existing = self.ctx.expirations.find(member_id).await?;
        let new_expiry = extension_base(existing.map(|r| r.expires_at), now)
            + time::Duration::days(COUPON_BONUS_DAYS);
        self.ctx.expirations.upsert(member_id, new_expiry).await?;
        self.ctx
            .registry
            .record_coupon_use(member_id, BONUS_COUPON, now)
            .await?;
        self.ctx
            .audit()
            .coupon_redeemed(member_id, BONUS_COUPON, COUPON_BONUS_DAYS)
            .await;
        info!(member = member_id.as_str(), "Bonus coupon redeemed");
        Ok(RedeemOutcome::BonusDays { new_expiry })
    }

    async fn record_indication(
        &self,
        member_id: &MemberId,
        tag: &str,
        now: OffsetDateTime,
    ) -> MembershipResult<RedeemOutcome> {
        if self.ctx.registry.coupon_used(member_id, tag).await? {
            return Err(MembershipError::CouponAlreadyUsed(tag.to_string()));
        }
        self.ctx.registry.set_indication(member_id, tag).await?;
        self.ctx.registry.record_coupon_use(member_id, tag, now).await?;
        self.ctx.audit().indication_recorded(member_id, tag).await;
        Ok(RedeemOutcome::IndicationTagged {
            tag: tag.to_string(),
        })
    }

    /// Start a payment: validate the amount against the plan matrix and
    /// the member's balance, open a private pix channel, record the
    /// session, create the gateway charge, and deliver the instructions.
    ///
    /// The channel teardown is scheduled before the gateway call so an
    /// abandoned or failed charge still gets its channel cleaned up.
    pub async fn begin_payment(
        &self,
        member_id: &MemberId,
        amount_cents: i64,
        now: OffsetDateTime,
    ) -> MembershipResult<PixCharge> {
        if self.ctx.registry.find(member_id).await?.is_none() {
            return Err(MembershipError::NotRegistered(member_id.to_string()));
        }
        let member = self.ctx.directory.fetch_member(member_id).await?;
        let balance = self.ctx.balances.balance(member_id).await?;
        let quote = PaymentQuote::for_amount(amount_cents, balance)?;

        let channel = match self
            .ctx
            .directory
            .create_private_channel(&NewChannel {
                name: format!("pix-{}", channel_slug(&member.username)),
                category: self.ctx.guild.channels.payments_category,
                member: member_id.clone(),
            })
            .await
        {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!(member = member_id.as_str(), error = %e, "Pix channel creation failed, falling back to DM");
                None
            }
        };
        if let Some(channel) = channel {
            self.ctx
                .sessions
                .put(&PaymentSession {
                    member: member_id.clone(),
                    channel,
                    amount_cents: quote.charge_cents,
                    balance_offset_cents: quote.balance_offset_cents,
                    created_at: now,
                })
                .await?;
            self.teardowns.schedule(channel, self.ctx.session_ttl);
        }

        let charge = self
            .ctx
            .gateway
            .create_payment(&NewPayment {
                member: member_id.clone(),
                amount_cents: quote.charge_cents,
                duration_days: quote.duration_days,
                balance_offset_cents: quote.balance_offset_cents,
            })
            .await?;

        self.send_instructions(member_id, channel, &quote, &charge).await;
        info!(
            member = member_id.as_str(),
            payment = charge.payment_id,
            amount_cents = quote.charge_cents,
            "Payment started"
        );
        Ok(charge)
    }

    async fn send_instructions(
        &self,
        member_id: &MemberId,
        channel: Option<ChannelId>,
        quote: &PaymentQuote,
        charge: &PixCharge,
    ) {
        let mut text = format!(
            "💠 | <@{member_id}>, pague {} via PIX para liberar {} dias de acesso.\n\
             Copia e cola:\n```{}```",
            format_brl(quote.charge_cents),
            quote.duration_days,
            charge.copy_paste_code
        );
        if quote.balance_offset_cents > 0 {
            text.push_str(&format!(
                "\n💳 | {} do seu saldo serão aplicados na confirmação.",
                format_brl(quote.balance_offset_cents)
            ));
        }
        if let Some(channel) = channel {
            match self.ctx.directory.send_channel_message(channel, &text).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(member = member_id.as_str(), error = %e, "Pix instructions channel send failed");
                }
            }
        }
        if let Err(e) = self.ctx.directory.send_dm(member_id, &text).await {
            warn!(member = member_id.as_str(), error = %e, "Pix instructions DM failed");
        }
    }

    /// Everything the account panel shows for one member.
    pub async fn account_summary(
        &self,
        member_id: &MemberId,
        now: OffsetDateTime,
    ) -> MembershipResult<AccountSummary> {
        let Some(registration) = self.ctx.registry.find(member_id).await? else {
            return Err(MembershipError::NotRegistered(member_id.to_string()));
        };
        let balance_cents = self.ctx.balances.balance(member_id).await?;
        let last_payment = self
            .ctx
            .registry
            .payment_history(member_id)
            .await?
            .into_iter()
            .last();
        let status = match self.ctx.expirations.find(member_id).await? {
            Some(record) if record.expires_at > now => SubscriptionStatus::Active {
                expires_at: record.expires_at,
                days_left: days_left(record.expires_at, now),
            },
            Some(record) => SubscriptionStatus::Expired {
                expires_at: record.expires_at,
            },
            None => SubscriptionStatus::None,
        };
        Ok(AccountSummary {
            member: member_id.clone(),
            name: registration.name,
            contact: registration.contact,
            registered_at: registration.registered_at,
            balance_cents,
            last_payment,
            status,
        })
    }
}

/// Brazilian mobile shape: 2-digit area code followed by a 9-led
/// 9-digit number, digits only.
fn valid_mobile(contact: &str) -> bool {
    contact.len() == 11
        && contact.bytes().all(|b| b.is_ascii_digit())
        && contact.as_bytes()[2] == b'9'
}

/// Directory snowflakes are 17-20 decimal digits; anything shaped like
/// one is treated as a referral id.
fn looks_like_member_id(code: &str) -> bool {
    (17..=20).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BalanceStore, ExpirationStore, MemberRegistry};
    use crate::testkit::{
        guild_member, harness, registration, TestHarness, CONTACT_LOG, COUPONS_LOG, REGISTERED,
    };

    const REFERRER_ID: &str = "90000000000000007";
    const MEMBER_ID: &str = "90000000000000042";

    fn id(raw: &str) -> MemberId {
        MemberId::new(raw)
    }

    fn flows(h: &TestHarness) -> PanelFlows {
        let teardowns = Arc::new(ScheduledTeardowns::new(h.ctx.directory.clone()));
        PanelFlows::new(h.ctx.clone(), teardowns)
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn mobile_validation() {
        assert!(valid_mobile("11987654321"));
        assert!(!valid_mobile("1198765432"));
        assert!(!valid_mobile("119876543210"));
        assert!(!valid_mobile("11887654321"));
        assert!(!valid_mobile("11 98765432"));
    }

    #[test]
    fn referral_code_shape() {
        assert!(looks_like_member_id(REFERRER_ID));
        assert!(!looks_like_member_id("1234567890123456"));
        assert!(!looks_like_member_id("CUPOM"));
        assert!(!looks_like_member_id("900000000000000071234"));
    }

    #[tokio::test]
    async fn register_creates_user_balance_and_role() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        let f = flows(&h);

        f.register(&id("42"), "Ana Lima", "11987654321", now())
            .await
            .unwrap();

        let user = MemberRegistry::find(h.store.as_ref(), &id("42"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "Ana Lima");
        assert!(user.referred_by.is_none());
        assert_eq!(h.store.balance(&id("42")).await.unwrap(), 0);
        assert!(h.directory.member(&id("42")).unwrap().has_role(REGISTERED));
        let log = h.directory.channel_messages(CONTACT_LOG);
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("Ana Lima"));
    }

    #[tokio::test]
    async fn register_rejects_bad_phone_without_mutation() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        let f = flows(&h);

        let err = f
            .register(&id("42"), "Ana", "telefone", now())
            .await
            .unwrap_err();

        assert!(matches!(err, MembershipError::InvalidInput(_)));
        assert!(MemberRegistry::find(h.store.as_ref(), &id("42"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        let f = flows(&h);

        f.register(&id("42"), "Ana", "11987654321", now()).await.unwrap();
        let err = f
            .register(&id("42"), "Ana", "11987654321", now())
            .await
            .unwrap_err();

        assert!(matches!(err, MembershipError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn register_requires_guild_membership() {
        let h = harness();
        let f = flows(&h);
        let err = f
            .register(&id("404"), "Ana", "11987654321", now())
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::MemberNotFound(_)));
    }

    async fn seed_referral_pair(h: &TestHarness) {
        h.directory.insert_member(guild_member(REFERRER_ID, vec![]));
        h.directory.insert_member(guild_member(MEMBER_ID, vec![]));
        h.store.insert(&registration(REFERRER_ID)).await.unwrap();
        h.store.insert(&registration(MEMBER_ID)).await.unwrap();
        h.store
            .append_payment(
                &id(REFERRER_ID),
                &PaymentEntry {
                    amount_cents: 30_000,
                    paid_at: now() - time::Duration::days(10),
                    reference: "MP-9001".to_string(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn referral_code_links_the_referrer() {
        let h = harness();
        seed_referral_pair(&h).await;
        let f = flows(&h);

        let outcome = f.redeem(&id(MEMBER_ID), REFERRER_ID, now()).await.unwrap();

        assert_eq!(
            outcome,
            RedeemOutcome::ReferralLinked {
                referrer: id(REFERRER_ID)
            }
        );
        let user = MemberRegistry::find(h.store.as_ref(), &id(MEMBER_ID))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.referred_by, Some(id(REFERRER_ID)));
        assert_eq!(h.directory.channel_messages(COUPONS_LOG).len(), 1);
    }

    #[tokio::test]
    async fn self_referral_is_rejected() {
        let h = harness();
        seed_referral_pair(&h).await;
        let f = flows(&h);
        let err = f
            .redeem(&id(REFERRER_ID), REFERRER_ID, now())
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::InvalidCoupon(_)));
    }

    #[tokio::test]
    async fn referrer_without_payment_is_rejected() {
        let h = harness();
        h.store.insert(&registration(REFERRER_ID)).await.unwrap();
        h.store.insert(&registration(MEMBER_ID)).await.unwrap();
        let f = flows(&h);
        let err = f
            .redeem(&id(MEMBER_ID), REFERRER_ID, now())
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::InvalidCoupon(_)));
    }

    #[tokio::test]
    async fn paying_member_cannot_be_referred() {
        let h = harness();
        seed_referral_pair(&h).await;
        h.store
            .append_payment(
                &id(MEMBER_ID),
                &PaymentEntry {
                    amount_cents: 10_000,
                    paid_at: now(),
                    reference: "MP-9002".to_string(),
                },
            )
            .await
            .unwrap();
        let f = flows(&h);
        let err = f
            .redeem(&id(MEMBER_ID), REFERRER_ID, now())
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn second_referral_link_is_rejected() {
        let h = harness();
        seed_referral_pair(&h).await;
        let f = flows(&h);
        f.redeem(&id(MEMBER_ID), REFERRER_ID, now()).await.unwrap();
        let err = f
            .redeem(&id(MEMBER_ID), REFERRER_ID, now())
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::CouponAlreadyUsed(_)));
    }

    #[tokio::test]
    async fn bonus_coupon_extends_without_history_entry() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        let at = now();
        let f = flows(&h);

        let outcome = f.redeem(&id("42"), "cupom", at).await.unwrap();

        let RedeemOutcome::BonusDays { new_expiry } = outcome else {
            panic!("expected bonus days");
        };
        assert_eq!(new_expiry, at + time::Duration::days(2));
        let record = h.store.find(&id("42")).await.unwrap().unwrap();
        assert_eq!(record.expires_at, new_expiry);
        assert!(h.store.payment_history(&id("42")).await.unwrap().is_empty());

        let err = f.redeem(&id("42"), "CUPOM", at).await.unwrap_err();
        assert!(matches!(err, MembershipError::CouponAlreadyUsed(_)));
    }

    #[tokio::test]
    async fn bonus_coupon_stacks_on_an_unexpired_window() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        let at = now();
        h.store
            .upsert(&id("42"), at + time::Duration::days(5))
            .await
            .unwrap();
        let f = flows(&h);

        let outcome = f.redeem(&id("42"), "CUPOM", at).await.unwrap();

        assert_eq!(
            outcome,
            RedeemOutcome::BonusDays {
                new_expiry: at + time::Duration::days(7)
            }
        );
    }

    #[tokio::test]
    async fn indication_tag_is_recorded_once() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        let f = flows(&h);

        let outcome = f.redeem(&id("42"), "instagram", now()).await.unwrap();

        assert_eq!(
            outcome,
            RedeemOutcome::IndicationTagged {
                tag: "INSTAGRAM".to_string()
            }
        );
        let user = MemberRegistry::find(h.store.as_ref(), &id("42"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.indication.as_deref(), Some("INSTAGRAM"));

        let err = f.redeem(&id("42"), "INSTAGRAM", now()).await.unwrap_err();
        assert!(matches!(err, MembershipError::CouponAlreadyUsed(_)));
    }

    #[tokio::test]
    async fn unknown_code_is_invalid() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        let f = flows(&h);
        let err = f.redeem(&id("42"), "DESCONTO50", now()).await.unwrap_err();
        assert!(matches!(err, MembershipError::InvalidCoupon(_)));
    }

    #[tokio::test]
    async fn redeem_requires_registration() {
        let h = harness();
        let f = flows(&h);
        let err = f.redeem(&id("42"), "CUPOM", now()).await.unwrap_err();
        assert!(matches!(err, MembershipError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn begin_payment_opens_channel_session_and_charge() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        h.store.insert(&registration("42")).await.unwrap();
        let f = flows(&h);

        let charge = f.begin_payment(&id("42"), 30_000, now()).await.unwrap();

        let channels = h.directory.created_channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "pix-user-42");
        let session = h.store.session_for(&id("42")).await.unwrap();
        assert_eq!(session.channel, channels[0].id);
        assert_eq!(session.amount_cents, 30_000);
        assert_eq!(session.balance_offset_cents, 0);
        let created = h.gateway.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].amount_cents, 30_000);
        assert_eq!(created[0].duration_days, 30);
        let sent = h.directory.channel_messages(channels[0].id);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(&charge.copy_paste_code));
        assert!(sent[0].contains("R$ 300,00"));
    }

    #[tokio::test]
    async fn begin_payment_quotes_the_balance_discount() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        h.store.insert(&registration("42")).await.unwrap();
        h.store.adjust(&id("42"), 5_000).await.unwrap();
        let f = flows(&h);

        f.begin_payment(&id("42"), 25_000, now()).await.unwrap();

        let created = h.gateway.created();
        assert_eq!(created[0].amount_cents, 25_000);
        assert_eq!(created[0].balance_offset_cents, 5_000);
        assert_eq!(created[0].duration_days, 30);
        let session = h.store.session_for(&id("42")).await.unwrap();
        assert_eq!(session.balance_offset_cents, 5_000);
        // The balance itself is only debited when the payment settles.
        assert_eq!(h.store.balance(&id("42")).await.unwrap(), 5_000);
    }

    #[tokio::test]
    async fn begin_payment_rejects_off_matrix_amounts() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        h.store.insert(&registration("42")).await.unwrap();
        let f = flows(&h);

        let err = f.begin_payment(&id("42"), 12_345, now()).await.unwrap_err();

        assert!(matches!(err, MembershipError::InvalidAmount(_)));
        assert!(h.directory.created_channels().is_empty());
        assert!(h.gateway.created().is_empty());
    }

    #[tokio::test]
    async fn begin_payment_requires_registration() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        let f = flows(&h);
        let err = f.begin_payment(&id("42"), 30_000, now()).await.unwrap_err();
        assert!(matches!(err, MembershipError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn channel_failure_falls_back_to_dm_without_session() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        h.directory.set_channel_create_fails(true);
        h.store.insert(&registration("42")).await.unwrap();
        let f = flows(&h);

        let charge = f.begin_payment(&id("42"), 10_000, now()).await.unwrap();

        assert!(h.store.session_for(&id("42")).await.is_none());
        let dms = h.directory.dms_to(&id("42"));
        assert_eq!(dms.len(), 1);
        assert!(dms[0].contains(&charge.copy_paste_code));
    }

    #[tokio::test]
    async fn gateway_failure_surfaces_after_channel_setup() {
        let h = harness();
        h.directory.insert_member(guild_member("42", vec![]));
        h.store.insert(&registration("42")).await.unwrap();
        h.gateway.set_create_fails(true);
        let f = flows(&h);

        let err = f.begin_payment(&id("42"), 30_000, now()).await.unwrap_err();

        assert!(matches!(err, MembershipError::Gateway(_)));
        // The session row stays; the teardown timer and the reaper own
        // the cleanup.
        assert!(h.store.session_for(&id("42")).await.is_some());
    }

    #[tokio::test]
    async fn account_summary_reports_status_and_balance() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        h.store.adjust(&id("42"), 7_500).await.unwrap();
        let at = now();
        h.store
            .upsert(&id("42"), at + time::Duration::days(12))
            .await
            .unwrap();
        h.store
            .append_payment(
                &id("42"),
                &PaymentEntry {
                    amount_cents: 30_000,
                    paid_at: at - time::Duration::days(18),
                    reference: "MP-1".to_string(),
                },
            )
            .await
            .unwrap();
        let f = flows(&h);

        let summary = f.account_summary(&id("42"), at).await.unwrap();

        assert_eq!(summary.balance_cents, 7_500);
        assert_eq!(summary.last_payment.unwrap().reference, "MP-1");
        assert_eq!(
            summary.status,
            SubscriptionStatus::Active {
                expires_at: at + time::Duration::days(12),
                days_left: 12
            }
        );
    }

    #[tokio::test]
    async fn account_summary_without_record_reports_none() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        let f = flows(&h);

        let summary = f.account_summary(&id("42"), now()).await.unwrap();

        assert_eq!(summary.status, SubscriptionStatus::None);
        assert!(summary.last_payment.is_none());
        assert_eq!(summary.balance_cents, 0);
    }

    #[tokio::test]
    async fn account_summary_reports_expired_windows() {
        let h = harness();
        h.store.insert(&registration("42")).await.unwrap();
        let at = now();
        h.store
            .upsert(&id("42"), at - time::Duration::days(1))
            .await
            .unwrap();
        let f = flows(&h);

        let summary = f.account_summary(&id("42"), at).await.unwrap();

        assert_eq!(
            summary.status,
            SubscriptionStatus::Expired {
                expires_at: at - time::Duration::days(1)
            }
        );
    }
}
