//! One in-memory store behind every persistence port, plus a broadcast
//! change feed that mirrors the trigger payloads: inserts and updates
//! carry the document, deletes carry the row id only.
//!
//! Row ids are stable across updates, as they are in the real store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    BalanceStore, ChangeEvent, ChangeFeed, ChangeStream, ExpirationRecord, ExpirationStore,
    FeedOp, FeedTable, MemberRegistry, PaymentEntry, PaymentSession, RegisteredUser,
    ReminderKind, SessionStore,
};
use crate::error::{MembershipError, MembershipResult};
use portaria_shared::MemberId;

struct ExpirationSlot {
    row_id: Uuid,
    expires_at: OffsetDateTime,
}

struct UserSlot {
    row_id: Uuid,
    user: RegisteredUser,
}

#[derive(Default)]
struct State {
    expirations: HashMap<String, ExpirationSlot>,
    notifications: HashMap<(String, String), OffsetDateTime>,
    balances: HashMap<String, i64>,
    users: HashMap<String, UserSlot>,
    history: HashMap<String, Vec<PaymentEntry>>,
    coupons: HashMap<(String, String), OffsetDateTime>,
    sessions: HashMap<String, PaymentSession>,
}

pub struct InMemoryStore {
    state: Mutex<State>,
    feed_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (feed_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State::default()),
            feed_tx,
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ChangeEvent) {
        // No subscribers is fine; most tests drive handlers directly.
        let _ = self.feed_tx.send(event);
    }

    /// Row id of the member's expiration record, for crafting feed
    /// events in tests.
    pub fn expiration_row_id(&self, member: &MemberId) -> Option<Uuid> {
        self.locked().expirations.get(member.as_str()).map(|s| s.row_id)
    }

    /// Row id of the member's registration record.
    pub fn registration_row_id(&self, member: &MemberId) -> Option<Uuid> {
        self.locked().users.get(member.as_str()).map(|s| s.row_id)
    }

    /// Expiration lookup without trait disambiguation, for tests with
    /// several store ports in scope.
    pub async fn find(&self, member: &MemberId) -> MembershipResult<Option<ExpirationRecord>> {
        ExpirationStore::find(self, member).await
    }

    /// The registered user, panicking when the test forgot to seed one.
    pub async fn find_user(&self, member: &MemberId) -> RegisteredUser {
        match self.locked().users.get(member.as_str()) {
            Some(slot) => slot.user.clone(),
            None => panic!("user {member} not seeded"),
        }
    }

    pub async fn session_for(&self, member: &MemberId) -> Option<PaymentSession> {
        self.locked().sessions.get(member.as_str()).cloned()
    }
}

#[async_trait]
impl ExpirationStore for InMemoryStore {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<ExpirationRecord>> {
        Ok(self.locked().expirations.get(member.as_str()).map(|slot| {
            ExpirationRecord {
                member: member.clone(),
                expires_at: slot.expires_at,
            }
        }))
    }

    async fn all(&self) -> MembershipResult<Vec<ExpirationRecord>> {
        let mut records: Vec<ExpirationRecord> = self
            .locked()
            .expirations
            .iter()
            .map(|(member, slot)| ExpirationRecord {
                member: MemberId::new(member),
                expires_at: slot.expires_at,
            })
            .collect();
        records.sort_by_key(|r| r.expires_at);
        Ok(records)
    }

    async fn upsert(
        &self,
        member: &MemberId,
        expires_at: OffsetDateTime,
    ) -> MembershipResult<()> {
        let event = {
            let mut state = self.locked();
            match state.expirations.get_mut(member.as_str()) {
                Some(slot) => {
                    slot.expires_at = expires_at;
                    ChangeEvent {
                        table: FeedTable::Expirations,
                        op: FeedOp::Update,
                        row_id: slot.row_id,
                        member: Some(member.clone()),
                        expires_at: Some(expires_at),
                    }
                }
                None => {
                    let row_id = Uuid::new_v4();
                    state.expirations.insert(
                        member.to_string(),
                        ExpirationSlot { row_id, expires_at },
                    );
                    ChangeEvent {
                        table: FeedTable::Expirations,
                        op: FeedOp::Insert,
                        row_id,
                        member: Some(member.clone()),
                        expires_at: Some(expires_at),
                    }
                }
            }
        };
        self.emit(event);
        Ok(())
    }

    async fn delete(&self, member: &MemberId) -> MembershipResult<()> {
        let removed = self.locked().expirations.remove(member.as_str());
        if let Some(slot) = removed {
            self.emit(ChangeEvent {
                table: FeedTable::Expirations,
                op: FeedOp::Delete,
                row_id: slot.row_id,
                member: None,
                expires_at: None,
            });
        }
        Ok(())
    }

    async fn find_member_by_row(&self, row_id: Uuid) -> MembershipResult<Option<MemberId>> {
        Ok(self
            .locked()
            .expirations
            .iter()
            .find(|(_, slot)| slot.row_id == row_id)
            .map(|(member, _)| MemberId::new(member)))
    }

    async fn was_notified(
        &self,
        member: &MemberId,
        kind: ReminderKind,
    ) -> MembershipResult<bool> {
        let key = (member.to_string(), kind.as_str().to_string());
        Ok(self.locked().notifications.contains_key(&key))
    }

    async fn record_notification(
        &self,
        member: &MemberId,
        kind: ReminderKind,
        at: OffsetDateTime,
    ) -> MembershipResult<()> {
        let key = (member.to_string(), kind.as_str().to_string());
        self.locked().notifications.entry(key).or_insert(at);
        Ok(())
    }

    async fn clear_notifications(&self, member: &MemberId) -> MembershipResult<()> {
        self.locked()
            .notifications
            .retain(|(m, _), _| m != member.as_str());
        Ok(())
    }
}

#[async_trait]
impl BalanceStore for InMemoryStore {
    async fn balance(&self, member: &MemberId) -> MembershipResult<i64> {
        Ok(self.locked().balances.get(member.as_str()).copied().unwrap_or(0))
    }

    async fn adjust(&self, member: &MemberId, delta_cents: i64) -> MembershipResult<()> {
        *self.locked().balances.entry(member.to_string()).or_insert(0) += delta_cents;
        Ok(())
    }

    async fn initialize(&self, member: &MemberId) -> MembershipResult<()> {
        self.locked().balances.entry(member.to_string()).or_insert(0);
        Ok(())
    }
}

#[async_trait]
impl MemberRegistry for InMemoryStore {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<RegisteredUser>> {
        Ok(self
            .locked()
            .users
            .get(member.as_str())
            .map(|slot| slot.user.clone()))
    }

    async fn insert(&self, user: &RegisteredUser) -> MembershipResult<()> {
        let event = {
            let mut state = self.locked();
            if state.users.contains_key(user.member.as_str()) {
                return Err(MembershipError::AlreadyRegistered(user.member.to_string()));
            }
            let row_id = Uuid::new_v4();
            state.users.insert(
                user.member.to_string(),
                UserSlot {
                    row_id,
                    user: user.clone(),
                },
            );
            ChangeEvent {
                table: FeedTable::Registrations,
                op: FeedOp::Insert,
                row_id,
                member: Some(user.member.clone()),
                expires_at: None,
            }
        };
        self.emit(event);
        Ok(())
    }

    async fn delete(&self, member: &MemberId) -> MembershipResult<()> {
        let removed = self.locked().users.remove(member.as_str());
        if let Some(slot) = removed {
            self.emit(ChangeEvent {
                table: FeedTable::Registrations,
                op: FeedOp::Delete,
                row_id: slot.row_id,
                member: None,
                expires_at: None,
            });
        }
        Ok(())
    }

    async fn find_member_by_row(&self, row_id: Uuid) -> MembershipResult<Option<MemberId>> {
        Ok(self
            .locked()
            .users
            .iter()
            .find(|(_, slot)| slot.row_id == row_id)
            .map(|(member, _)| MemberId::new(member)))
    }

    async fn set_referred_by(
        &self,
        member: &MemberId,
        referrer: &MemberId,
    ) -> MembershipResult<()> {
        let mut state = self.locked();
        if let Some(slot) = state.users.get_mut(member.as_str()) {
            if slot.user.referred_by.is_none() {
                slot.user.referred_by = Some(referrer.clone());
            }
        }
        Ok(())
    }

    async fn set_referral_bonus_paid(&self, member: &MemberId) -> MembershipResult<()> {
        if let Some(slot) = self.locked().users.get_mut(member.as_str()) {
            slot.user.referral_bonus_paid = true;
        }
        Ok(())
    }

    async fn set_indication(&self, member: &MemberId, tag: &str) -> MembershipResult<()> {
        if let Some(slot) = self.locked().users.get_mut(member.as_str()) {
            slot.user.indication = Some(tag.to_string());
        }
        Ok(())
    }

    async fn payment_history(&self, member: &MemberId) -> MembershipResult<Vec<PaymentEntry>> {
        Ok(self
            .locked()
            .history
            .get(member.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn append_payment(
        &self,
        member: &MemberId,
        entry: &PaymentEntry,
    ) -> MembershipResult<()> {
        let mut state = self.locked();
        let duplicate = state
            .history
            .values()
            .flatten()
            .any(|e| e.reference == entry.reference);
        if duplicate {
            return Err(MembershipError::DuplicatePayment(entry.reference.clone()));
        }
        state
            .history
            .entry(member.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn has_reference(
        &self,
        member: &MemberId,
        reference: &str,
    ) -> MembershipResult<bool> {
        Ok(self
            .locked()
            .history
            .get(member.as_str())
            .is_some_and(|entries| entries.iter().any(|e| e.reference == reference)))
    }

    async fn coupon_used(&self, member: &MemberId, coupon: &str) -> MembershipResult<bool> {
        let key = (member.to_string(), coupon.to_string());
        Ok(self.locked().coupons.contains_key(&key))
    }

    async fn record_coupon_use(
        &self,
        member: &MemberId,
        coupon: &str,
        at: OffsetDateTime,
    ) -> MembershipResult<()> {
        let key = (member.to_string(), coupon.to_string());
        self.locked().coupons.entry(key).or_insert(at);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn find(&self, member: &MemberId) -> MembershipResult<Option<PaymentSession>> {
        Ok(self.locked().sessions.get(member.as_str()).cloned())
    }

    async fn put(&self, session: &PaymentSession) -> MembershipResult<()> {
        self.locked()
            .sessions
            .insert(session.member.to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, member: &MemberId) -> MembershipResult<()> {
        self.locked().sessions.remove(member.as_str());
        Ok(())
    }

    async fn stale(&self, cutoff: OffsetDateTime) -> MembershipResult<Vec<PaymentSession>> {
        Ok(self
            .locked()
            .sessions
            .values()
            .filter(|s| s.created_at < cutoff)
            .cloned()
            .collect())
    }
}

pub struct InMemoryChangeStream {
    rx: broadcast::Receiver<ChangeEvent>,
}

#[async_trait]
impl ChangeStream for InMemoryChangeStream {
    async fn next_event(&mut self) -> MembershipResult<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Feed receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(MembershipError::Feed("feed closed".to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for InMemoryStore {
    async fn subscribe(&self) -> MembershipResult<Box<dyn ChangeStream>> {
        Ok(Box::new(InMemoryChangeStream {
            rx: self.feed_tx.subscribe(),
        }))
    }
}
