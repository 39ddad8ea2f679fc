//! Cross-crate identifier and plan types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Directory member id (snowflake), kept as text because that is how the
/// store and the gateway's `external_reference` field carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Directory role id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directory channel id (also used for category ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription plan tiers. Single-tenant and hard-coded: the community
/// sells exactly two access windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Weekly,
    Monthly,
}

/// Referral bonus credited to the referrer on the referred user's first
/// full-price monthly payment.
pub const REFERRAL_BONUS_CENTS: i64 = 5_000;

/// Bonus days granted by the promotional coupon.
pub const COUPON_BONUS_DAYS: i64 = 2;

impl Plan {
    pub fn price_cents(&self) -> i64 {
        match self {
            Plan::Weekly => 10_000,
            Plan::Monthly => 30_000,
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            Plan::Weekly => 7,
            Plan::Monthly => 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Weekly => "weekly",
            Plan::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format an integer-cents amount as Brazilian currency ("R$ 300,00").
pub fn format_brl(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{}R$ {},{:02}", sign, abs / 100, abs % 100)
}

/// Format a timestamp as a Brazilian calendar date ("11/06/2025").
pub fn format_date_br(at: time::OffsetDateTime) -> String {
    let format = time::macros::format_description!("[day]/[month]/[year]");
    at.format(format).unwrap_or_else(|_| at.to_string())
}
