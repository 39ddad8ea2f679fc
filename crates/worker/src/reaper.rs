//! Stale payment-session cleanup.
//!
//! The in-process teardown timers die with the process. This pass
//! catches the sessions they left behind: any session older than the
//! ttl gets its pix channel deleted and its row dropped.

use time::OffsetDateTime;
use tracing::{info, warn};

use portaria_membership::{EngineContext, MembershipResult};

pub async fn reap_stale_sessions(
    ctx: &EngineContext,
    now: OffsetDateTime,
) -> MembershipResult<usize> {
    let cutoff = now - ctx.session_ttl;
    let stale = ctx.sessions.stale(cutoff).await?;
    let mut reaped = 0;
    for session in stale {
        // Channel deletion is best effort; the row goes regardless, or
        // a dead channel would pin the session forever.
        if let Err(e) = ctx.directory.delete_channel(session.channel).await {
            warn!(
                member = session.member.as_str(),
                channel = session.channel.0,
                error = %e,
                "Stale session channel delete failed"
            );
        }
        ctx.sessions.delete(&session.member).await?;
        reaped += 1;
    }
    if reaped > 0 {
        info!(reaped, "Stale payment sessions cleaned up");
    }
    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use portaria_membership::cache::ResolutionCache;
    use portaria_membership::directory::memory::InMemoryDirectory;
    use portaria_membership::gateway::memory::InMemoryGateway;
    use portaria_membership::store::memory::InMemoryStore;
    use portaria_membership::store::{PaymentSession, SessionStore};
    use portaria_shared::{
        ChannelConfig, ChannelId, GuildConfig, MemberId, RoleConfig, RoleId,
    };

    use super::*;

    struct Fixture {
        directory: Arc<InMemoryDirectory>,
        store: Arc<InMemoryStore>,
        ctx: EngineContext,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let store = Arc::new(InMemoryStore::new());
        let ctx = EngineContext {
            directory: directory.clone(),
            gateway: Arc::new(InMemoryGateway::new()),
            expirations: store.clone(),
            balances: store.clone(),
            registry: store.clone(),
            sessions: store.clone(),
            feed: store.clone(),
            cache: Arc::new(ResolutionCache::new(64)),
            guild: GuildConfig {
                guild_id: 900_000_000_000_000_001,
                roles: RoleConfig {
                    vip: RoleId(10),
                    awaiting: RoleId(20),
                    registered: RoleId(30),
                },
                channels: ChannelConfig {
                    notices: ChannelId(1),
                    payments_log: ChannelId(2),
                    coupons_log: ChannelId(3),
                    removals_log: ChannelId(4),
                    contact_log: ChannelId(5),
                    bot_log: ChannelId(6),
                    payments_category: ChannelId(7),
                    expirations_category: ChannelId(8),
                },
            },
            session_ttl: Duration::from_secs(12 * 3_600),
        };
        Fixture {
            directory,
            store,
            ctx,
        }
    }

    fn session(id: &str, channel: u64, created_at: OffsetDateTime) -> PaymentSession {
        PaymentSession {
            member: MemberId::new(id),
            channel: ChannelId(channel),
            amount_cents: 10_000,
            balance_offset_cents: 0,
            created_at,
        }
    }

    #[tokio::test]
    async fn old_sessions_are_reaped_fresh_ones_kept() {
        let f = fixture();
        let now = OffsetDateTime::now_utc();
        f.store
            .put(&session("42", 100, now - time::Duration::hours(13)))
            .await
            .unwrap();
        f.store
            .put(&session("43", 101, now - time::Duration::hours(1)))
            .await
            .unwrap();

        let reaped = reap_stale_sessions(&f.ctx, now).await.unwrap();

        assert_eq!(reaped, 1);
        assert_eq!(f.directory.deleted_channels(), vec![ChannelId(100)]);
        assert!(f.store.session_for(&MemberId::new("42")).await.is_none());
        assert!(f.store.session_for(&MemberId::new("43")).await.is_some());
    }

    #[tokio::test]
    async fn row_is_dropped_even_when_the_channel_delete_fails() {
        let f = fixture();
        let now = OffsetDateTime::now_utc();
        f.store
            .put(&session("42", 100, now - time::Duration::hours(13)))
            .await
            .unwrap();
        f.directory.set_unavailable(true);

        let reaped = reap_stale_sessions(&f.ctx, now).await.unwrap();

        assert_eq!(reaped, 1);
        assert!(f.store.session_for(&MemberId::new("42")).await.is_none());
    }

    #[tokio::test]
    async fn nothing_stale_is_a_quiet_pass() {
        let f = fixture();
        let reaped = reap_stale_sessions(&f.ctx, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(reaped, 0);
        assert!(f.directory.deleted_channels().is_empty());
    }
}
