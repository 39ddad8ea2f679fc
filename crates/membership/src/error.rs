//! Error taxonomy for the membership engine.
//!
//! Hierarchy violations during role mutations are deliberately absent:
//! they are reported as a skipped outcome by the role synchronizer, never
//! raised as errors.

use thiserror::Error;

pub type MembershipResult<T> = Result<T, MembershipError>;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Member not found in directory: {0}")]
    MemberNotFound(String),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Payment already processed: {0}")]
    DuplicatePayment(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid coupon: {0}")]
    InvalidCoupon(String),

    #[error("Coupon already redeemed: {0}")]
    CouponAlreadyUsed(String),

    #[error("Member already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Member not registered: {0}")]
    NotRegistered(String),

    #[error("Member already has payment history: {0}")]
    AlreadySubscribed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
