//! In-memory fixtures shared across service tests.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use portaria_shared::{ChannelConfig, ChannelId, GuildConfig, MemberId, RoleConfig, RoleId};

use crate::cache::ResolutionCache;
use crate::context::EngineContext;
use crate::directory::memory::InMemoryDirectory;
use crate::directory::{Member, Role};
use crate::gateway::memory::InMemoryGateway;
use crate::store::memory::InMemoryStore;
use crate::store::RegisteredUser;

pub const VIP: RoleId = RoleId(10);
pub const AWAITING: RoleId = RoleId(20);
pub const REGISTERED: RoleId = RoleId(30);

pub const NOTICES: ChannelId = ChannelId(1);
pub const PAYMENTS_LOG: ChannelId = ChannelId(2);
pub const COUPONS_LOG: ChannelId = ChannelId(3);
pub const REMOVALS_LOG: ChannelId = ChannelId(4);
pub const CONTACT_LOG: ChannelId = ChannelId(5);
pub const BOT_LOG: ChannelId = ChannelId(6);

pub struct TestHarness {
    pub directory: Arc<InMemoryDirectory>,
    pub gateway: Arc<InMemoryGateway>,
    pub store: Arc<InMemoryStore>,
    pub ctx: EngineContext,
}

pub fn guild() -> GuildConfig {
    GuildConfig {
        guild_id: 900_000_000_000_000_001,
        roles: RoleConfig {
            vip: VIP,
            awaiting: AWAITING,
            registered: REGISTERED,
        },
        channels: ChannelConfig {
            notices: NOTICES,
            payments_log: PAYMENTS_LOG,
            coupons_log: COUPONS_LOG,
            removals_log: REMOVALS_LOG,
            contact_log: CONTACT_LOG,
            bot_log: BOT_LOG,
            payments_category: ChannelId(7),
            expirations_category: ChannelId(8),
        },
    }
}

/// Directory pre-seeded with the managed roles and a service account
/// that out-ranks them, plus empty gateway and store.
pub fn harness() -> TestHarness {
    let directory = Arc::new(InMemoryDirectory::new());
    for (role, name, position) in [
        (VIP, "vip", 5),
        (AWAITING, "awaiting", 4),
        (REGISTERED, "registered", 3),
        (RoleId(99), "service", 50),
    ] {
        directory.insert_role(Role {
            id: role,
            name: name.into(),
            position,
        });
    }
    directory.set_own(Member {
        id: MemberId::new("1"),
        username: "portaria".into(),
        role_ids: vec![RoleId(99)],
    });

    let gateway = Arc::new(InMemoryGateway::new());
    let store = Arc::new(InMemoryStore::new());

    let ctx = EngineContext {
        directory: directory.clone(),
        gateway: gateway.clone(),
        expirations: store.clone(),
        balances: store.clone(),
        registry: store.clone(),
        sessions: store.clone(),
        feed: store.clone(),
        cache: Arc::new(ResolutionCache::new(64)),
        guild: guild(),
        session_ttl: Duration::from_secs(12 * 3_600),
    };

    TestHarness {
        directory,
        gateway,
        store,
        ctx,
    }
}

pub fn guild_member(id: &str, roles: Vec<RoleId>) -> Member {
    Member {
        id: MemberId::new(id),
        username: format!("user-{id}"),
        role_ids: roles,
    }
}

pub fn registration(id: &str) -> RegisteredUser {
    RegisteredUser {
        member: MemberId::new(id),
        name: format!("Pessoa {id}"),
        contact: "11987654321".into(),
        registered_at: OffsetDateTime::now_utc(),
        referred_by: None,
        referral_bonus_paid: false,
        indication: None,
    }
}
