//! Shared foundations for the portaria workspace.
//!
//! Everything more than one crate needs lives here: environment-driven
//! configuration, database pool construction and migrations, and the
//! small cross-crate types (member/role/channel ids, plan tiers).

pub mod config;
pub mod db;
pub mod types;

pub use config::{ChannelConfig, Config, ConfigError, GuildConfig, RoleConfig};
pub use db::{create_pool, run_migrations};
pub use types::{
    format_brl, format_date_br, ChannelId, MemberId, Plan, RoleId, COUPON_BONUS_DAYS,
    REFERRAL_BONUS_CENTS,
};
