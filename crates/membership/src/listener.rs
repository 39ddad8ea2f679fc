//! Change-feed listener: reacts to expiration and registration rows
//! changing underneath the engine (webhook writes, admin edits straight
//! in the database) without polling.
//!
//! Member resolution runs through a fixed resolver order; delete events
//! carry only a row id, so the bounded cache of past resolutions is the
//! last resort for them. An unresolvable event is logged and skipped,
//! never fatal. The subscription itself retries forever on a fixed
//! delay.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use portaria_shared::MemberId;

use crate::context::EngineContext;
use crate::error::MembershipError;
use crate::store::{ChangeEvent, FeedOp, FeedTable};
use crate::sweeper::ExpirationSweeper;

const RESUBSCRIBE_DELAY_MS: u64 = 5_000;

/// Resolution strategies, tried in [`RESOLUTION_ORDER`].
#[derive(Debug, Clone, Copy)]
enum Resolver {
    /// Member id carried in the event document itself.
    Document,
    /// Row-id lookup against the owning store.
    Store,
    /// Bounded cache of past resolutions; the only source left for
    /// deletes, whose row is already gone.
    Cache,
}

const RESOLUTION_ORDER: [Resolver; 3] = [Resolver::Document, Resolver::Store, Resolver::Cache];

impl Resolver {
    fn name(self) -> &'static str {
        match self {
            Resolver::Document => "document",
            Resolver::Store => "store",
            Resolver::Cache => "cache",
        }
    }
}

pub struct ChangeFeedListener {
    ctx: EngineContext,
    sweeper: Arc<ExpirationSweeper>,
}

impl ChangeFeedListener {
    pub fn new(ctx: EngineContext, sweeper: Arc<ExpirationSweeper>) -> Self {
        Self { ctx, sweeper }
    }

    /// Subscribes and processes events until the stream breaks, then
    /// resubscribes after a fixed delay. Runs until process shutdown.
    pub async fn run(self: Arc<Self>) {
        loop {
            let subscribe = || async {
                self.ctx.feed.subscribe().await.map_err(|e| {
                    warn!(error = %e, "Change feed subscription failed, retrying");
                    e
                })
            };
            let Ok(mut stream) =
                Retry::spawn(FixedInterval::from_millis(RESUBSCRIBE_DELAY_MS), subscribe).await
            else {
                // FixedInterval never exhausts, so spawn cannot fail.
                continue;
            };
            info!("Change feed subscribed");
            loop {
                match stream.next_event().await {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => {
                        warn!(error = %e, "Change feed stream failed, resubscribing");
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(RESUBSCRIBE_DELAY_MS)).await;
        }
    }

    async fn resolve(&self, event: &ChangeEvent) -> Option<MemberId> {
        for resolver in RESOLUTION_ORDER {
            let resolved = match resolver {
                Resolver::Document => event.member.clone(),
                Resolver::Store => self.store_lookup(event).await,
                Resolver::Cache => self.ctx.cache.get(&event.row_id),
            };
            if let Some(member) = resolved {
                debug!(
                    resolver = resolver.name(),
                    row = %event.row_id,
                    member = member.as_str(),
                    "Feed event resolved"
                );
                return Some(member);
            }
        }
        None
    }

    async fn store_lookup(&self, event: &ChangeEvent) -> Option<MemberId> {
        let lookup = match event.table {
            FeedTable::Expirations => self.ctx.expirations.find_member_by_row(event.row_id).await,
            FeedTable::Registrations => self.ctx.registry.find_member_by_row(event.row_id).await,
        };
        match lookup {
            Ok(found) => found,
            Err(e) => {
                warn!(row = %event.row_id, error = %e, "Row-id lookup failed");
                None
            }
        }
    }

    pub async fn handle_event(&self, event: ChangeEvent) {
        let Some(member) = self.resolve(&event).await else {
            warn!(
                table = ?event.table,
                op = ?event.op,
                row = %event.row_id,
                "Dropping unresolvable feed event"
            );
            return;
        };
        match (event.table, event.op) {
            (FeedTable::Expirations, FeedOp::Insert | FeedOp::Update) => {
                self.ctx.cache.insert(event.row_id, member.clone());
                self.expiration_upserted(&member, event.expires_at).await;
            }
            (FeedTable::Expirations, FeedOp::Delete) => {
                self.expiration_deleted(&member).await;
                self.ctx.cache.remove(&event.row_id);
            }
            (FeedTable::Registrations, FeedOp::Insert | FeedOp::Update) => {
                self.ctx.cache.insert(event.row_id, member);
            }
            (FeedTable::Registrations, FeedOp::Delete) => {
                self.registration_deleted(&member).await;
                self.ctx.cache.remove(&event.row_id);
            }
        }
    }

    /// A window moved. Future-dated windows activate the member,
    /// past-dated ones revoke straight away; either way the sweep timer
    /// is re-anchored, since the deadline set just shifted.
    async fn expiration_upserted(&self, member: &MemberId, expires_at: Option<OffsetDateTime>) {
        let Some(expires_at) = expires_at else {
            warn!(member = member.as_str(), "Expiration event without a deadline");
            return;
        };
        let active = expires_at > OffsetDateTime::now_utc();
        match self.ctx.roles().sync_entitlement(member, active).await {
            Ok(report) if !report.fully_applied() => {
                warn!(member = member.as_str(), active, "Entitlement sync partially applied");
            }
            Ok(_) => debug!(member = member.as_str(), active, "Entitlement synced from feed"),
            Err(e) => warn!(member = member.as_str(), error = %e, "Entitlement sync failed"),
        }
        self.sweeper.restart();
    }

    /// Out-of-band record removal (admin panel, manual query): the member
    /// loses access immediately.
    async fn expiration_deleted(&self, member: &MemberId) {
        info!(member = member.as_str(), "Expiration record removed externally");
        match self.ctx.roles().sync_entitlement(member, false).await {
            Ok(report) if !report.fully_applied() => {
                warn!(member = member.as_str(), "Revocation partially applied");
            }
            Ok(_) => {}
            Err(e) => warn!(member = member.as_str(), error = %e, "Revocation failed"),
        }
        if let Err(e) = self.ctx.expirations.clear_notifications(member).await {
            warn!(member = member.as_str(), error = %e, "Notification cleanup failed");
        }
        self.ctx.audit().subscription_removed(member).await;
    }

    /// Registration removal strips every managed role and purges the
    /// member's subscription state.
    async fn registration_deleted(&self, member: &MemberId) {
        info!(member = member.as_str(), "Registration removed");
        match self.ctx.directory.fetch_member(member).await {
            Ok(full) => match self.ctx.roles().remove_all(&full).await {
                Ok(report) => {
                    for (role, outcome) in &report {
                        if !outcome.applied() {
                            warn!(member = member.as_str(), role = role.0, ?outcome, "Role removal incomplete");
                        }
                    }
                }
                Err(e) => warn!(member = member.as_str(), error = %e, "Role removal failed"),
            },
            Err(MembershipError::MemberNotFound(_)) => {
                debug!(member = member.as_str(), "Member already departed");
            }
            Err(e) => {
                warn!(member = member.as_str(), error = %e, "Member fetch failed during deregistration");
            }
        }
        if let Err(e) = self.ctx.expirations.delete(member).await {
            warn!(member = member.as_str(), error = %e, "Expiration purge failed");
        }
        if let Err(e) = self.ctx.expirations.clear_notifications(member).await {
            warn!(member = member.as_str(), error = %e, "Notification cleanup failed");
        }
        self.ctx.audit().registration_removed(member).await;
    }
}
