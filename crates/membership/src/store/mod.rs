//! Persistence ports: expiration windows, balances, the member registry,
//! payment sessions, and the change feed over the watched tables.
//!
//! Postgres adapters live in [`postgres`]; a single in-memory store
//! implementing every port backs the tests in [`memory`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::MembershipResult;
use portaria_shared::{ChannelId, MemberId};

/// A registered community member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredUser {
    pub member: MemberId,
    pub name: String,
    pub contact: String,
    pub registered_at: OffsetDateTime,
    pub referred_by: Option<MemberId>,
    pub referral_bonus_paid: bool,
    pub indication: Option<String>,
}

/// One approved payment in a member's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEntry {
    pub amount_cents: i64,
    pub paid_at: OffsetDateTime,
    pub reference: String,
}

/// A member's subscription window. At most one per member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationRecord {
    pub member: MemberId,
    pub expires_at: OffsetDateTime,
}

/// An in-flight payment: the member, their private channel, and the
/// pending charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSession {
    pub member: MemberId,
    pub channel: ChannelId,
    pub amount_cents: i64,
    pub balance_offset_cents: i64,
    pub created_at: OffsetDateTime,
}

/// Reminder kinds sent ahead of expiry, each at most once per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReminderKind {
    ThreeDays,
    OneDay,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderKind::ThreeDays => "3days",
            ReminderKind::OneDay => "1day",
        }
    }
}

impl std::fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ExpirationStore: Send + Sync {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<ExpirationRecord>>;

    async fn all(&self) -> MembershipResult<Vec<ExpirationRecord>>;

    /// Insert or update the member's window. The row id survives updates.
    async fn upsert(&self, member: &MemberId, expires_at: OffsetDateTime)
        -> MembershipResult<()>;

    async fn delete(&self, member: &MemberId) -> MembershipResult<()>;

    /// Resolve a change-feed row id to its member.
    async fn find_member_by_row(&self, row_id: Uuid) -> MembershipResult<Option<MemberId>>;

    async fn was_notified(&self, member: &MemberId, kind: ReminderKind)
        -> MembershipResult<bool>;

    /// At-most-once: recording an already-recorded (member, kind) is a
    /// no-op, not an error.
    async fn record_notification(
        &self,
        member: &MemberId,
        kind: ReminderKind,
        at: OffsetDateTime,
    ) -> MembershipResult<()>;

    async fn clear_notifications(&self, member: &MemberId) -> MembershipResult<()>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Current balance; absent members read as 0.
    async fn balance(&self, member: &MemberId) -> MembershipResult<i64>;

    /// Atomic signed increment, creating the row when missing. The only
    /// mutation primitive; balances are never overwritten wholesale.
    async fn adjust(&self, member: &MemberId, delta_cents: i64) -> MembershipResult<()>;

    /// Ensure a zero-balance row exists (registration time).
    async fn initialize(&self, member: &MemberId) -> MembershipResult<()>;
}

#[async_trait]
pub trait MemberRegistry: Send + Sync {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<RegisteredUser>>;

    /// Returns `AlreadyRegistered` when the member already has a row.
    async fn insert(&self, user: &RegisteredUser) -> MembershipResult<()>;

    async fn delete(&self, member: &MemberId) -> MembershipResult<()>;

    async fn find_member_by_row(&self, row_id: Uuid) -> MembershipResult<Option<MemberId>>;

    /// Set the referrer; immutable once set.
    async fn set_referred_by(
        &self,
        member: &MemberId,
        referrer: &MemberId,
    ) -> MembershipResult<()>;

    async fn set_referral_bonus_paid(&self, member: &MemberId) -> MembershipResult<()>;

    async fn set_indication(&self, member: &MemberId, tag: &str) -> MembershipResult<()>;

    /// Payment history ordered by `paid_at`.
    async fn payment_history(&self, member: &MemberId) -> MembershipResult<Vec<PaymentEntry>>;

    async fn append_payment(
        &self,
        member: &MemberId,
        entry: &PaymentEntry,
    ) -> MembershipResult<()>;

    /// Whether the member's history already carries this reference.
    async fn has_reference(&self, member: &MemberId, reference: &str)
        -> MembershipResult<bool>;

    async fn coupon_used(&self, member: &MemberId, coupon: &str) -> MembershipResult<bool>;

    async fn record_coupon_use(
        &self,
        member: &MemberId,
        coupon: &str,
        at: OffsetDateTime,
    ) -> MembershipResult<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<PaymentSession>>;

    /// One session per member; a new one replaces the old.
    async fn put(&self, session: &PaymentSession) -> MembershipResult<()>;

    async fn delete(&self, member: &MemberId) -> MembershipResult<()>;

    /// Sessions created before `cutoff`.
    async fn stale(&self, cutoff: OffsetDateTime) -> MembershipResult<Vec<PaymentSession>>;
}

/// Watched tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedTable {
    Expirations,
    Registrations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOp {
    Insert,
    Update,
    Delete,
}

/// One change-feed notification. Delete events carry only the row id;
/// the listener resolves the member through its resolver chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub op: FeedOp,
    pub row_id: Uuid,
    pub member: Option<MemberId>,
    pub expires_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a fresh subscription covering both watched tables.
    async fn subscribe(&self) -> MembershipResult<Box<dyn ChangeStream>>;
}

/// A live subscription. `next_event` pends until an event arrives and
/// fails only when the subscription itself breaks.
#[async_trait]
pub trait ChangeStream: Send {
    async fn next_event(&mut self) -> MembershipResult<ChangeEvent>;
}
