//! MercadoPago PIX adapter.
//!
//! The wire talks decimal reais; everything behind the port is integer
//! cents, converted only here. Each create carries a fresh
//! `X-Idempotency-Key` as the gateway requires for PIX.

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{NewPayment, PaymentDetails, PaymentStatus, PixCharge, PixGateway};
use crate::error::{MembershipError, MembershipResult};
use portaria_shared::MemberId;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.mercadopago.com";

pub struct MercadoPagoClient {
    client: Client,
    base: String,
    access_token: String,
    notification_url: String,
}

#[derive(Debug, Deserialize)]
struct CreatedPaymentBody {
    id: i64,
    point_of_interaction: PointOfInteractionBody,
}

#[derive(Debug, Deserialize)]
struct PointOfInteractionBody {
    transaction_data: TransactionDataBody,
}

#[derive(Debug, Deserialize)]
struct TransactionDataBody {
    qr_code_base64: String,
    qr_code: String,
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    id: i64,
    status: PaymentStatus,
    external_reference: Option<String>,
    transaction_amount: f64,
    #[serde(default)]
    metadata: MetadataBody,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataBody {
    #[serde(default)]
    balance_used_cents: Option<i64>,
}

fn cents_to_reais(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn reais_to_cents(reais: f64) -> i64 {
    (reais * 100.0).round() as i64
}

impl MercadoPagoClient {
    pub fn new(access_token: &str, app_public_url: &str) -> Self {
        Self::with_base(access_token, app_public_url, DEFAULT_API_BASE)
    }

    /// Construct against a non-default API base (test servers).
    pub fn with_base(access_token: &str, app_public_url: &str, base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            notification_url: format!(
                "{}/webhook-mercadopago",
                app_public_url.trim_end_matches('/')
            ),
        }
    }
}

#[async_trait::async_trait]
impl PixGateway for MercadoPagoClient {
    async fn create_payment(&self, req: &NewPayment) -> MembershipResult<PixCharge> {
        let url = format!("{}/v1/payments", self.base);
        let body = json!({
            "transaction_amount": cents_to_reais(req.amount_cents),
            "description": format!("Taxa de acesso ({} dias)", req.duration_days),
            "payment_method_id": "pix",
            "payer": { "email": format!("user-{}@portaria.app", req.member) },
            "external_reference": req.member.to_string(),
            "notification_url": self.notification_url,
            "metadata": { "balance_used_cents": req.balance_offset_cents },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(user_id = %req.member, "Payment create transport failure: {}", e);
                MembershipError::Gateway(format!("payment create failed: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(MembershipError::Gateway(format!(
                "payment create returned {}",
                response.status()
            )));
        }

        let created: CreatedPaymentBody = response.json().await.map_err(|e| {
            MembershipError::Gateway(format!("payment create body: {e}"))
        })?;
        Ok(PixCharge {
            payment_id: created.id,
            qr_code_base64: created.point_of_interaction.transaction_data.qr_code_base64,
            copy_paste_code: created.point_of_interaction.transaction_data.qr_code,
        })
    }

    async fn fetch_payment(&self, payment_id: i64) -> MembershipResult<PaymentDetails> {
        let url = format!("{}/v1/payments/{}", self.base, payment_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| {
                MembershipError::Gateway(format!("payment fetch failed: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(MembershipError::Gateway(format!(
                "payment fetch returned {}",
                response.status()
            )));
        }

        let body: PaymentBody = response.json().await.map_err(|e| {
            MembershipError::Gateway(format!("payment body: {e}"))
        })?;
        Ok(PaymentDetails {
            id: body.id,
            status: body.status,
            payer: body.external_reference.map(MemberId),
            amount_cents: reais_to_cents(body.transaction_amount),
            balance_offset_cents: body.metadata.balance_used_cents.unwrap_or(0),
        })
    }
}

/// Verify the gateway's `x-signature` header against the shared secret.
///
/// The header carries `ts=<unix>,v1=<hex hmac>`; the signed manifest is
/// `id:<data.id>;request-id:<x-request-id>;ts:<ts>;` with the id
/// lowercased, HMAC-SHA256 under the secret.
pub fn verify_webhook_signature(
    secret: &str,
    signature_header: &str,
    request_id: &str,
    data_id: &str,
) -> bool {
    let mut ts: Option<&str> = None;
    let mut v1: Option<&str> = None;
    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("ts"), Some(value)) => ts = Some(value),
            (Some("v1"), Some(value)) => v1 = Some(value),
            _ => {}
        }
    }
    let (Some(ts), Some(v1)) = (ts, v1) else {
        return false;
    };

    let manifest = format!(
        "id:{};request-id:{};ts:{};",
        data_id.to_lowercase(),
        request_id,
        ts
    );
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(manifest.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());
    computed.as_bytes().ct_eq(v1.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn signature_for(secret: &str, data_id: &str, request_id: &str, ts: &str) -> String {
        let manifest = format!("id:{data_id};request-id:{request_id};ts:{ts};");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(manifest.as_bytes());
        format!("ts={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn cents_and_reais_round_trip() {
        assert_eq!(cents_to_reais(30_000), 300.0);
        assert_eq!(reais_to_cents(300.0), 30_000);
        assert_eq!(reais_to_cents(0.1 + 0.2), 30);
        assert_eq!(reais_to_cents(299.99), 29_999);
    }

    #[tokio::test]
    async fn create_sends_reais_and_parses_charge() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payments")
            .match_header("authorization", "Bearer mp-token")
            .match_header("x-idempotency-key", Matcher::Regex("^[0-9a-f-]{36}$".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "transaction_amount": 300.0,
                "description": "Taxa de acesso (30 dias)",
                "payment_method_id": "pix",
                "external_reference": "42",
                "notification_url": "https://pay.example.com/webhook-mercadopago",
                "metadata": { "balance_used_cents": 0 },
            })))
            .with_status(201)
            .with_body(
                json!({
                    "id": 555_001,
                    "point_of_interaction": {
                        "transaction_data": {
                            "qr_code_base64": "aGVsbG8=",
                            "qr_code": "00020126pix-code",
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway =
            MercadoPagoClient::with_base("mp-token", "https://pay.example.com", &server.url());
        let charge = gateway
            .create_payment(&NewPayment {
                member: MemberId::new("42"),
                amount_cents: 30_000,
                duration_days: 30,
                balance_offset_cents: 0,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(charge.payment_id, 555_001);
        assert_eq!(charge.qr_code_base64, "aGVsbG8=");
        assert_eq!(charge.copy_paste_code, "00020126pix-code");
    }

    #[tokio::test]
    async fn fetch_converts_amounts_to_cents() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/555001")
            .with_status(200)
            .with_body(
                json!({
                    "id": 555_001,
                    "status": "approved",
                    "external_reference": "42",
                    "transaction_amount": 250.0,
                    "metadata": { "balance_used_cents": 5_000 },
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway =
            MercadoPagoClient::with_base("mp-token", "https://pay.example.com", &server.url());
        let details = gateway.fetch_payment(555_001).await.unwrap();
        assert_eq!(details.status, PaymentStatus::Approved);
        assert_eq!(details.payer, Some(MemberId::new("42")));
        assert_eq!(details.amount_cents, 25_000);
        assert_eq!(details.balance_offset_cents, 5_000);
        assert_eq!(details.reference(), "MP-555001");
    }

    #[tokio::test]
    async fn foreign_payment_has_no_payer() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/9")
            .with_status(200)
            .with_body(
                json!({
                    "id": 9,
                    "status": "approved",
                    "external_reference": null,
                    "transaction_amount": 10.0,
                })
                .to_string(),
            )
            .create_async()
            .await;

        let gateway =
            MercadoPagoClient::with_base("mp-token", "https://pay.example.com", &server.url());
        let details = gateway.fetch_payment(9).await.unwrap();
        assert_eq!(details.payer, None);
        assert_eq!(details.balance_offset_cents, 0);
    }

    #[tokio::test]
    async fn gateway_fault_maps_to_gateway_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/1")
            .with_status(500)
            .create_async()
            .await;

        let gateway =
            MercadoPagoClient::with_base("mp-token", "https://pay.example.com", &server.url());
        let err = gateway.fetch_payment(1).await.unwrap_err();
        assert!(matches!(err, MembershipError::Gateway(_)));
    }

    #[test]
    fn valid_signature_verifies() {
        let header = signature_for("shh", "555001", "req-1", "1700000000");
        assert!(verify_webhook_signature("shh", &header, "req-1", "555001"));
    }

    #[test]
    fn tampered_signature_fails() {
        let header = signature_for("shh", "555001", "req-1", "1700000000");
        assert!(!verify_webhook_signature("other", &header, "req-1", "555001"));
        assert!(!verify_webhook_signature("shh", &header, "req-2", "555001"));
        assert!(!verify_webhook_signature("shh", &header, "req-1", "555002"));
        assert!(!verify_webhook_signature("shh", "garbage", "req-1", "555001"));
    }

    #[test]
    fn uppercase_id_is_lowercased_before_signing() {
        let header = signature_for("shh", "abc123", "req-1", "1700000000");
        assert!(verify_webhook_signature("shh", &header, "req-1", "ABC123"));
    }
}
