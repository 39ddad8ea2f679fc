//! Subscription arithmetic: day counting, extension bases, and the
//! charge/duration quoting shared by the payment panel and the webhook
//! reconciler.
//!
//! Quoting and reconciliation MUST agree on duration for every charge the
//! panel can emit, so both go through [`duration_days`].

use time::{Duration, OffsetDateTime};

use crate::error::{MembershipError, MembershipResult};
use portaria_shared::{format_brl, Plan};

/// Smallest charge the gateway accepts, R$1,00.
pub const MIN_CHARGE_CENTS: i64 = 100;

const SECS_PER_DAY: i64 = 86_400;

/// Whole days remaining until `expires_at`, rounded up. One second into
/// the future counts as 1; an instant in the past counts at or below 0.
pub fn days_left(expires_at: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let secs = (expires_at - now).whole_seconds();
    (secs + SECS_PER_DAY - 1).div_euclid(SECS_PER_DAY)
}

/// Base instant an extension is applied from: the current expiry while it
/// is still in the future, otherwise `now`. Lapsed time is never credited.
pub fn extension_base(existing: Option<OffsetDateTime>, now: OffsetDateTime) -> OffsetDateTime {
    match existing {
        Some(expires_at) if expires_at > now => expires_at,
        _ => now,
    }
}

/// Entitlement duration for a settled charge. Weekly is matched first on
/// the paid amount alone, then on paid + balance offset; everything else
/// is a monthly grant.
pub fn duration_days(amount_cents: i64, balance_offset_cents: i64) -> i64 {
    if amount_cents == Plan::Weekly.price_cents() {
        return Plan::Weekly.days();
    }
    if balance_offset_cents > 0
        && amount_cents + balance_offset_cents == Plan::Weekly.price_cents()
    {
        return Plan::Weekly.days();
    }
    Plan::Monthly.days()
}

/// A validated charge request: what the member pays now, how much of it
/// is covered by their bonus balance, and how many days it buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentQuote {
    pub charge_cents: i64,
    pub balance_offset_cents: i64,
    pub duration_days: i64,
}

impl PaymentQuote {
    /// Validate a requested amount against the plan matrix and the
    /// member's balance. Accepted amounts are the weekly price, the
    /// monthly price, and (when the member holds a balance) the
    /// discounted monthly price `max(R$1, monthly - balance)`.
    pub fn for_amount(amount_cents: i64, balance_cents: i64) -> MembershipResult<Self> {
        let weekly = Plan::Weekly.price_cents();
        let monthly = Plan::Monthly.price_cents();

        if balance_cents > 0 {
            let discounted = (monthly - balance_cents).max(MIN_CHARGE_CENTS);
            if amount_cents == discounted {
                let offset = monthly - discounted;
                return Ok(Self {
                    charge_cents: discounted,
                    balance_offset_cents: offset,
                    duration_days: duration_days(discounted, offset),
                });
            }
        }

        if amount_cents == weekly {
            return Ok(Self {
                charge_cents: weekly,
                balance_offset_cents: 0,
                duration_days: Plan::Weekly.days(),
            });
        }

        if amount_cents == monthly {
            return Ok(Self {
                charge_cents: monthly,
                balance_offset_cents: 0,
                duration_days: Plan::Monthly.days(),
            });
        }

        let mut options = vec![format_brl(weekly), format_brl(monthly)];
        if balance_cents > 0 {
            options.push(format!(
                "{} (mensal com desconto)",
                format_brl((monthly - balance_cents).max(MIN_CHARGE_CENTS))
            ));
        }
        Err(MembershipError::InvalidAmount(format!(
            "{} is not a plan price; accepted: {}",
            format_brl(amount_cents),
            options.join(", ")
        )))
    }

    /// New expiry produced by settling this quote on top of an optional
    /// existing record.
    pub fn extend(
        &self,
        existing: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> OffsetDateTime {
        extension_base(existing, now) + Duration::days(self.duration_days)
    }
}
