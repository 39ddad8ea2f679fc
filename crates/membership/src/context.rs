//! Shared wiring for the engine.
//!
//! Every service (listener, sweeper, reconciler, panel flows) borrows
//! its collaborators from one [`EngineContext`] instead of reaching for
//! globals. The context is cheap to clone; all ports sit behind `Arc`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use portaria_shared::{Config, GuildConfig};

use crate::audit::AuditLog;
use crate::cache::ResolutionCache;
use crate::directory::rest::RestDirectory;
use crate::directory::Directory;
use crate::gateway::mercadopago::MercadoPagoClient;
use crate::gateway::PixGateway;
use crate::roles::RoleSynchronizer;
use crate::store::postgres::{
    PgBalanceStore, PgChangeFeed, PgExpirationStore, PgMemberRegistry, PgSessionStore,
};
use crate::store::{BalanceStore, ChangeFeed, ExpirationStore, MemberRegistry, SessionStore};

/// Row-id resolutions kept for feed events that arrive without a
/// member id.
const RESOLUTION_CACHE_CAPACITY: usize = 1_024;

#[derive(Clone)]
pub struct EngineContext {
    pub directory: Arc<dyn Directory>,
    pub gateway: Arc<dyn PixGateway>,
    pub expirations: Arc<dyn ExpirationStore>,
    pub balances: Arc<dyn BalanceStore>,
    pub registry: Arc<dyn MemberRegistry>,
    pub sessions: Arc<dyn SessionStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub cache: Arc<ResolutionCache>,
    pub guild: GuildConfig,
    pub session_ttl: Duration,
}

impl EngineContext {
    /// Wires the production adapters: Postgres stores and feed, the
    /// Discord REST directory and the Mercado Pago gateway.
    pub fn production(config: &Config, pool: PgPool) -> Self {
        Self {
            directory: Arc::new(RestDirectory::new(
                &config.discord_token,
                config.guild.guild_id,
            )),
            gateway: Arc::new(MercadoPagoClient::new(
                &config.mp_access_token,
                &config.app_public_url,
            )),
            expirations: Arc::new(PgExpirationStore::new(pool.clone())),
            balances: Arc::new(PgBalanceStore::new(pool.clone())),
            registry: Arc::new(PgMemberRegistry::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            feed: Arc::new(PgChangeFeed::new(pool)),
            cache: Arc::new(ResolutionCache::new(RESOLUTION_CACHE_CAPACITY)),
            guild: config.guild.clone(),
            session_ttl: Duration::from_secs(config.session_ttl_hours * 3_600),
        }
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::new(self.directory.clone(), self.guild.channels)
    }

    pub fn roles(&self) -> RoleSynchronizer {
        RoleSynchronizer::new(self.directory.clone(), self.guild.roles)
    }
}
