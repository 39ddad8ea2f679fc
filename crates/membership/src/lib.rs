// Membership crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Portaria membership engine.
//!
//! Reconciles paid subscriptions with guild entitlements for a single
//! community: approved PIX payments extend a member's expiration window,
//! a change-feed listener mirrors window changes onto directory roles,
//! and an hourly sweeper sends reminders and handles expiry (auto-renewal
//! from the bonus balance, or revocation).
//!
//! External collaborators (directory, store, payment gateway) sit behind
//! capability ports with production adapters and in-memory test adapters.
//! All wiring flows through [`EngineContext`]; there are no globals.

pub mod audit;
pub mod cache;
pub mod context;
pub mod directory;
pub mod error;
pub mod flows;
pub mod gateway;
pub mod listener;
pub mod plan;
pub mod reconciler;
pub mod roles;
pub mod store;
pub mod sweeper;
pub mod teardown;

#[cfg(test)]
pub mod testkit;

pub use audit::AuditLog;
pub use cache::ResolutionCache;
pub use context::EngineContext;
pub use error::{MembershipError, MembershipResult};
pub use flows::{AccountSummary, PanelFlows, RedeemOutcome, SubscriptionStatus};
pub use listener::ChangeFeedListener;
pub use reconciler::PaymentReconciler;
pub use roles::{MutationOutcome, RoleSynchronizer, SyncReport};
pub use sweeper::ExpirationSweeper;
pub use teardown::ScheduledTeardowns;
