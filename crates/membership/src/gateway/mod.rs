//! Payment gateway port: create a PIX charge, fetch a payment by id.
//!
//! Amounts cross this boundary as integer cents; adapters own whatever
//! unit the wire uses.

pub mod memory;
pub mod mercadopago;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::MembershipResult;
use portaria_shared::MemberId;

/// Request to create a PIX charge for a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub member: MemberId,
    pub amount_cents: i64,
    pub duration_days: i64,
    pub balance_offset_cents: i64,
}

/// A created charge: what the member needs to pay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixCharge {
    pub payment_id: i64,
    pub qr_code_base64: String,
    pub copy_paste_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Approved,
    Pending,
    InProcess,
    Rejected,
    Cancelled,
    Refunded,
    #[serde(other)]
    Other,
}

/// A payment as fetched back from the gateway. `payer` is absent when the
/// payment was not created by this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentDetails {
    pub id: i64,
    pub status: PaymentStatus,
    pub payer: Option<MemberId>,
    pub amount_cents: i64,
    pub balance_offset_cents: i64,
}

impl PaymentDetails {
    /// Gateway-scoped idempotency reference recorded in payment history.
    pub fn reference(&self) -> String {
        format!("MP-{}", self.id)
    }
}

#[async_trait]
pub trait PixGateway: Send + Sync {
    async fn create_payment(&self, req: &NewPayment) -> MembershipResult<PixCharge>;

    async fn fetch_payment(&self, payment_id: i64) -> MembershipResult<PaymentDetails>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_is_object_safe() {
        fn _accepts_dyn(_gw: &dyn PixGateway) {}
    }

    #[test]
    fn reference_is_gateway_scoped() {
        let details = PaymentDetails {
            id: 123_456_789,
            status: PaymentStatus::Approved,
            payer: Some(MemberId::new("42")),
            amount_cents: 30_000,
            balance_offset_cents: 0,
        };
        assert_eq!(details.reference(), "MP-123456789");
    }

    #[test]
    fn unknown_statuses_parse_as_other() {
        let status: PaymentStatus = serde_json::from_str(r#""charged_back""#).unwrap();
        assert_eq!(status, PaymentStatus::Other);
        let approved: PaymentStatus = serde_json::from_str(r#""approved""#).unwrap();
        assert_eq!(approved, PaymentStatus::Approved);
    }
}
