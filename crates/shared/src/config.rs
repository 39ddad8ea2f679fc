//! Environment-driven configuration.
//!
//! Both binaries build a [`Config`] at startup with [`Config::from_env`];
//! missing or malformed variables surface as descriptive errors instead
//! of panics so a bad deploy fails loudly and early.

use crate::types::{ChannelId, RoleId};
use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Guild role ids the engine projects entitlement state onto.
#[derive(Debug, Clone, Copy)]
pub struct RoleConfig {
    /// Paid-access role granted while a subscription is active.
    pub vip: RoleId,
    /// Role held while access is revoked pending payment.
    pub awaiting: RoleId,
    /// Role granted once at registration.
    pub registered: RoleId,
}

/// Fixed guild channels the engine posts notices to.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Public notice channel (reminders, removals, renewals).
    pub notices: ChannelId,
    /// Payment audit log.
    pub payments_log: ChannelId,
    /// Coupon / referral audit log.
    pub coupons_log: ChannelId,
    /// Departed-member / revocation audit log.
    pub removals_log: ChannelId,
    /// Registration contact log.
    pub contact_log: ChannelId,
    /// Operational bot log.
    pub bot_log: ChannelId,
    /// Category private payment channels are created under.
    pub payments_category: ChannelId,
    /// Category private expiration-notice channels are created under.
    pub expirations_category: ChannelId,
}

/// Everything the engine needs to know about the one guild it serves.
#[derive(Debug, Clone)]
pub struct GuildConfig {
    pub guild_id: u64,
    pub roles: RoleConfig,
    pub channels: ChannelConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub discord_token: String,
    pub guild: GuildConfig,
    pub mp_access_token: String,
    /// Webhook signature secret; verification is skipped when unset.
    pub mp_webhook_secret: Option<String>,
    /// Public base URL the gateway calls back on.
    pub app_public_url: String,
    pub port: u16,
    pub sweep_period_secs: u64,
    pub sweep_initial_delay_secs: u64,
    /// Payment-session (and private payment channel) lifetime.
    pub session_ttl_hours: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let guild = GuildConfig {
            guild_id: require_u64("GUILD_ID")?,
            roles: RoleConfig {
                vip: RoleId(require_u64("ROLE_VIP")?),
                awaiting: RoleId(require_u64("ROLE_AWAITING")?),
                registered: RoleId(require_u64("ROLE_REGISTERED")?),
            },
            channels: ChannelConfig {
                notices: ChannelId(require_u64("CHANNEL_NOTICES")?),
                payments_log: ChannelId(require_u64("CHANNEL_PAYMENTS_LOG")?),
                coupons_log: ChannelId(require_u64("CHANNEL_COUPONS_LOG")?),
                removals_log: ChannelId(require_u64("CHANNEL_REMOVALS_LOG")?),
                contact_log: ChannelId(require_u64("CHANNEL_CONTACT_LOG")?),
                bot_log: ChannelId(require_u64("CHANNEL_BOT_LOG")?),
                payments_category: ChannelId(require_u64("CATEGORY_PAYMENTS")?),
                expirations_category: ChannelId(require_u64("CATEGORY_EXPIRATIONS")?),
            },
        };

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            discord_token: require("DISCORD_TOKEN")?,
            guild,
            mp_access_token: require("MP_ACCESS_TOKEN")?,
            mp_webhook_secret: optional("MP_WEBHOOK_SECRET"),
            app_public_url: require("APP_PUBLIC_URL")?,
            port: parse_or("PORT", 8080)?,
            sweep_period_secs: parse_or("SWEEP_PERIOD_SECS", 3_600)?,
            sweep_initial_delay_secs: parse_or("SWEEP_INITIAL_DELAY_SECS", 60)?,
            session_ttl_hours: parse_or("SESSION_TTL_HOURS", 12)?,
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn optional(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn require_u64(var: &'static str) -> Result<u64, ConfigError> {
    let raw = require(var)?;
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value: raw })
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        _ => Ok(default),
    }
}
