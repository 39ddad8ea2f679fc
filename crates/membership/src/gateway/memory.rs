//! In-memory payment gateway for tests: created charges are held as
//! pending payments and approved by the test driving the scenario.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{NewPayment, PaymentDetails, PaymentStatus, PixCharge, PixGateway};
use crate::error::{MembershipError, MembershipResult};

#[derive(Default)]
struct State {
    payments: HashMap<i64, PaymentDetails>,
    created: Vec<NewPayment>,
    next_id: i64,
    create_fails: bool,
}

#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 100_000,
                ..State::default()
            }),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_create_fails(&self, fails: bool) {
        self.locked().create_fails = fails;
    }

    /// Flip a pending payment to approved, as the real gateway would after
    /// the member pays.
    pub fn approve(&self, payment_id: i64) {
        if let Some(details) = self.locked().payments.get_mut(&payment_id) {
            details.status = PaymentStatus::Approved;
        }
    }

    /// Seed a payment that did not come from `create_payment` (foreign or
    /// hand-crafted webhook scenarios).
    pub fn seed_payment(&self, details: PaymentDetails) {
        self.locked().payments.insert(details.id, details);
    }

    /// Every request passed to `create_payment`, in order.
    pub fn created(&self) -> Vec<NewPayment> {
        self.locked().created.clone()
    }
}

#[async_trait]
impl PixGateway for InMemoryGateway {
    async fn create_payment(&self, req: &NewPayment) -> MembershipResult<PixCharge> {
        let mut state = self.locked();
        if state.create_fails {
            return Err(MembershipError::Gateway(
                "injected create failure".to_string(),
            ));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.payments.insert(
            id,
            PaymentDetails {
                id,
                status: PaymentStatus::Pending,
                payer: Some(req.member.clone()),
                amount_cents: req.amount_cents,
                balance_offset_cents: req.balance_offset_cents,
            },
        );
        state.created.push(req.clone());
        Ok(PixCharge {
            payment_id: id,
            qr_code_base64: format!("qr-{id}"),
            copy_paste_code: format!("00020126-pix-{id}"),
        })
    }

    async fn fetch_payment(&self, payment_id: i64) -> MembershipResult<PaymentDetails> {
        self.locked()
            .payments
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| {
                MembershipError::Gateway(format!("unknown payment: {payment_id}"))
            })
    }
}
