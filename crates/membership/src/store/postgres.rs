//! Postgres adapters for the persistence ports and the change feed.
//!
//! Balances mutate only through atomic increments; at-most-once records
//! (notifications, coupon usage) ride on `ON CONFLICT DO NOTHING`; the
//! change feed rides on `LISTEN` against the trigger-published channels.

use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BalanceStore, ChangeEvent, ChangeFeed, ChangeStream, ExpirationRecord, ExpirationStore,
    FeedOp, FeedTable, MemberRegistry, PaymentEntry, PaymentSession, RegisteredUser,
    ReminderKind, SessionStore,
};
use crate::error::{MembershipError, MembershipResult};
use portaria_shared::{ChannelId, MemberId};

pub struct PgExpirationStore {
    pool: PgPool,
}

pub struct PgBalanceStore {
    pool: PgPool,
}

pub struct PgMemberRegistry {
    pool: PgPool,
}

pub struct PgSessionStore {
    pool: PgPool,
}

pub struct PgChangeFeed {
    pool: PgPool,
}

impl PgExpirationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgBalanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgMemberRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgChangeFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExpirationRow {
    user_id: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct MemberRow {
    user_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    balance_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ExistsRow {
    found: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct RegisteredUserRow {
    user_id: String,
    name: String,
    contact: String,
    registered_at: OffsetDateTime,
    referred_by: Option<String>,
    referral_bonus_paid: bool,
    indication: Option<String>,
}

impl From<RegisteredUserRow> for RegisteredUser {
    fn from(row: RegisteredUserRow) -> Self {
        RegisteredUser {
            member: MemberId(row.user_id),
            name: row.name,
            contact: row.contact,
            registered_at: row.registered_at,
            referred_by: row.referred_by.map(MemberId),
            referral_bonus_paid: row.referral_bonus_paid,
            indication: row.indication,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentEntryRow {
    amount_cents: i64,
    paid_at: OffsetDateTime,
    reference: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    user_id: String,
    channel_id: String,
    amount_cents: i64,
    balance_offset_cents: i64,
    created_at: OffsetDateTime,
}

impl SessionRow {
    fn into_session(self) -> MembershipResult<PaymentSession> {
        let channel = self.channel_id.parse().map_err(|_| {
            MembershipError::Store(format!("unparseable channel id: {}", self.channel_id))
        })?;
        Ok(PaymentSession {
            member: MemberId(self.user_id),
            channel: ChannelId(channel),
            amount_cents: self.amount_cents,
            balance_offset_cents: self.balance_offset_cents,
            created_at: self.created_at,
        })
    }
}

#[async_trait::async_trait]
impl ExpirationStore for PgExpirationStore {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<ExpirationRecord>> {
        let row: Option<ExpirationRow> =
            sqlx::query_as("SELECT user_id, expires_at FROM expirations WHERE user_id = $1")
                .bind(member.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.map(|r| ExpirationRecord {
            member: MemberId(r.user_id),
            expires_at: r.expires_at,
        }))
    }

    async fn all(&self) -> MembershipResult<Vec<ExpirationRecord>> {
        let rows: Vec<ExpirationRow> =
            sqlx::query_as("SELECT user_id, expires_at FROM expirations ORDER BY expires_at")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| ExpirationRecord {
                member: MemberId(r.user_id),
                expires_at: r.expires_at,
            })
            .collect())
    }

    async fn upsert(
        &self,
        member: &MemberId,
        expires_at: OffsetDateTime,
    ) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO expirations (user_id, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(member.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, member: &MemberId) -> MembershipResult<()> {
        sqlx::query("DELETE FROM expirations WHERE user_id = $1")
            .bind(member.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn find_member_by_row(&self, row_id: Uuid) -> MembershipResult<Option<MemberId>> {
        let row: Option<MemberRow> =
            sqlx::query_as("SELECT user_id FROM expirations WHERE id = $1")
                .bind(row_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.map(|r| MemberId(r.user_id)))
    }

    async fn was_notified(
        &self,
        member: &MemberId,
        kind: ReminderKind,
    ) -> MembershipResult<bool> {
        let row: ExistsRow = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM notifications_sent WHERE user_id = $1 AND kind = $2) AS found",
        )
        .bind(member.as_str())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.found)
    }

    async fn record_notification(
        &self,
        member: &MemberId,
        kind: ReminderKind,
        at: OffsetDateTime,
    ) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications_sent (user_id, kind, notified_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, kind) DO NOTHING
            "#,
        )
        .bind(member.as_str())
        .bind(kind.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn clear_notifications(&self, member: &MemberId) -> MembershipResult<()> {
        sqlx::query("DELETE FROM notifications_sent WHERE user_id = $1")
            .bind(member.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BalanceStore for PgBalanceStore {
    async fn balance(&self, member: &MemberId) -> MembershipResult<i64> {
        let row: Option<BalanceRow> =
            sqlx::query_as("SELECT balance_cents FROM balances WHERE user_id = $1")
                .bind(member.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.map(|r| r.balance_cents).unwrap_or(0))
    }

    async fn adjust(&self, member: &MemberId, delta_cents: i64) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO balances (user_id, balance_cents)
            VALUES ($1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET balance_cents = balances.balance_cents + EXCLUDED.balance_cents
            "#,
        )
        .bind(member.as_str())
        .bind(delta_cents)
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn initialize(&self, member: &MemberId) -> MembershipResult<()> {
        sqlx::query(
            "INSERT INTO balances (user_id, balance_cents) VALUES ($1, 0) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(member.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MemberRegistry for PgMemberRegistry {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<RegisteredUser>> {
        let row: Option<RegisteredUserRow> = sqlx::query_as(
            r#"
            SELECT user_id, name, contact, registered_at, referred_by,
                   referral_bonus_paid, indication
            FROM registered_users
            WHERE user_id = $1
            "#,
        )
        .bind(member.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.map(RegisteredUser::from))
    }

    async fn insert(&self, user: &RegisteredUser) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO registered_users
                (user_id, name, contact, registered_at, referred_by,
                 referral_bonus_paid, indication)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user.member.as_str())
        .bind(&user.name)
        .bind(&user.contact)
        .bind(user.registered_at)
        .bind(user.referred_by.as_ref().map(|m| m.as_str()))
        .bind(user.referral_bonus_paid)
        .bind(user.indication.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
                MembershipError::AlreadyRegistered(user.member.to_string())
            } else {
                MembershipError::Store(e.to_string())
            }
        })?;
        Ok(())
    }

    async fn delete(&self, member: &MemberId) -> MembershipResult<()> {
        sqlx::query("DELETE FROM registered_users WHERE user_id = $1")
            .bind(member.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn find_member_by_row(&self, row_id: Uuid) -> MembershipResult<Option<MemberId>> {
        let row: Option<MemberRow> =
            sqlx::query_as("SELECT user_id FROM registered_users WHERE id = $1")
                .bind(row_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.map(|r| MemberId(r.user_id)))
    }

    async fn set_referred_by(
        &self,
        member: &MemberId,
        referrer: &MemberId,
    ) -> MembershipResult<()> {
        // Immutable once set; the guard is in the WHERE clause.
        sqlx::query(
            "UPDATE registered_users SET referred_by = $2 WHERE user_id = $1 AND referred_by IS NULL",
        )
        .bind(member.as_str())
        .bind(referrer.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn set_referral_bonus_paid(&self, member: &MemberId) -> MembershipResult<()> {
        sqlx::query("UPDATE registered_users SET referral_bonus_paid = TRUE WHERE user_id = $1")
            .bind(member.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn set_indication(&self, member: &MemberId, tag: &str) -> MembershipResult<()> {
        sqlx::query("UPDATE registered_users SET indication = $2 WHERE user_id = $1")
            .bind(member.as_str())
            .bind(tag)
            .execute(&self.pool)
            .await
            .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn payment_history(&self, member: &MemberId) -> MembershipResult<Vec<PaymentEntry>> {
        let rows: Vec<PaymentEntryRow> = sqlx::query_as(
            r#"
            SELECT amount_cents, paid_at, reference
            FROM payment_history
            WHERE user_id = $1
            ORDER BY paid_at
            "#,
        )
        .bind(member.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| PaymentEntry {
                amount_cents: r.amount_cents,
                paid_at: r.paid_at,
                reference: r.reference,
            })
            .collect())
    }

    async fn append_payment(
        &self,
        member: &MemberId,
        entry: &PaymentEntry,
    ) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_history (user_id, amount_cents, paid_at, reference)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(member.as_str())
        .bind(entry.amount_cents)
        .bind(entry.paid_at)
        .bind(&entry.reference)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
                MembershipError::DuplicatePayment(entry.reference.clone())
            } else {
                MembershipError::Store(e.to_string())
            }
        })?;
        Ok(())
    }

    async fn has_reference(
        &self,
        member: &MemberId,
        reference: &str,
    ) -> MembershipResult<bool> {
        let row: ExistsRow = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM payment_history WHERE user_id = $1 AND reference = $2) AS found",
        )
        .bind(member.as_str())
        .bind(reference)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.found)
    }

    async fn coupon_used(&self, member: &MemberId, coupon: &str) -> MembershipResult<bool> {
        let row: ExistsRow = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM coupon_usage WHERE user_id = $1 AND coupon = $2) AS found",
        )
        .bind(member.as_str())
        .bind(coupon)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(row.found)
    }

    async fn record_coupon_use(
        &self,
        member: &MemberId,
        coupon: &str,
        at: OffsetDateTime,
    ) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO coupon_usage (user_id, coupon, used_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, coupon) DO NOTHING
            "#,
        )
        .bind(member.as_str())
        .bind(coupon)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for PgSessionStore {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<PaymentSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT user_id, channel_id, amount_cents, balance_offset_cents, created_at
            FROM payment_sessions
            WHERE user_id = $1
            "#,
        )
        .bind(member.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        row.map(SessionRow::into_session).transpose()
    }

    async fn put(&self, session: &PaymentSession) -> MembershipResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_sessions
                (user_id, channel_id, amount_cents, balance_offset_cents, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                channel_id = EXCLUDED.channel_id,
                amount_cents = EXCLUDED.amount_cents,
                balance_offset_cents = EXCLUDED.balance_offset_cents,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(session.member.as_str())
        .bind(session.channel.to_string())
        .bind(session.amount_cents)
        .bind(session.balance_offset_cents)
        .bind(session.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, member: &MemberId) -> MembershipResult<()> {
        sqlx::query("DELETE FROM payment_sessions WHERE user_id = $1")
            .bind(member.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MembershipError::Store(e.to_string()))?;
        Ok(())
    }

    async fn stale(&self, cutoff: OffsetDateTime) -> MembershipResult<Vec<PaymentSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT user_id, channel_id, amount_cents, balance_offset_cents, created_at
            FROM payment_sessions
            WHERE created_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MembershipError::Store(e.to_string()))?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }
}

const EXPIRATION_CHANNEL: &str = "expiration_changes";
const REGISTRATION_CHANNEL: &str = "registration_changes";

/// Payload published by the table triggers. Deletes carry only `op` and
/// `id`.
#[derive(Debug, Deserialize)]
struct FeedPayload {
    op: String,
    id: Uuid,
    user_id: Option<String>,
    expires_at: Option<String>,
}

fn parse_payload(table: FeedTable, raw: &str) -> MembershipResult<ChangeEvent> {
    let payload: FeedPayload = serde_json::from_str(raw)
        .map_err(|e| MembershipError::Feed(format!("malformed payload: {e}")))?;
    let op = match payload.op.as_str() {
        "insert" => FeedOp::Insert,
        "update" => FeedOp::Update,
        "delete" => FeedOp::Delete,
        other => {
            return Err(MembershipError::Feed(format!("unknown op: {other}")));
        }
    };
    let expires_at = payload
        .expires_at
        .as_deref()
        .map(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|e| MembershipError::Feed(format!("bad expires_at: {e}")))
        })
        .transpose()?;
    Ok(ChangeEvent {
        table,
        op,
        row_id: payload.id,
        member: payload.user_id.map(MemberId),
        expires_at,
    })
}

pub struct PgChangeStream {
    listener: PgListener,
}

#[async_trait::async_trait]
impl ChangeStream for PgChangeStream {
    async fn next_event(&mut self) -> MembershipResult<ChangeEvent> {
        loop {
            let notification = self
                .listener
                .recv()
                .await
                .map_err(|e| MembershipError::Feed(e.to_string()))?;
            let table = match notification.channel() {
                EXPIRATION_CHANNEL => FeedTable::Expirations,
                REGISTRATION_CHANNEL => FeedTable::Registrations,
                other => {
                    tracing::warn!(channel = other, "Notification on unexpected channel");
                    continue;
                }
            };
            match parse_payload(table, notification.payload()) {
                Ok(event) => return Ok(event),
                Err(e) => {
                    // A bad payload must not tear down the subscription.
                    tracing::warn!(payload = notification.payload(), "Dropping feed event: {}", e);
                    continue;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> MembershipResult<Box<dyn ChangeStream>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| MembershipError::Feed(e.to_string()))?;
        listener
            .listen_all([EXPIRATION_CHANNEL, REGISTRATION_CHANNEL])
            .await
            .map_err(|e| MembershipError::Feed(e.to_string()))?;
        Ok(Box::new(PgChangeStream { listener }))
    }
}
