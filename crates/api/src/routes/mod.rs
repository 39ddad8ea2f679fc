//! HTTP surface: the payment-gateway webhook, direct charge creation,
//! the member panel, and liveness.
//!
//! The webhook handler acknowledges before it processes. Mercado Pago
//! retries aggressively on anything but a fast 200, so the fetch and
//! settlement run in a spawned task and the response never waits on
//! them.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use portaria_membership::flows::SubscriptionStatus;
use portaria_membership::gateway::mercadopago::verify_webhook_signature;
use portaria_membership::gateway::NewPayment;
use portaria_membership::RedeemOutcome;
use portaria_shared::MemberId;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook-mercadopago", post(webhook_mercadopago))
        .route("/create-payment", post(create_payment))
        .route("/panel/register", post(panel_register))
        .route("/panel/deposit", post(panel_deposit))
        .route("/panel/redeem", post(panel_redeem))
        .route("/panel/account/{member_id}", get(panel_account))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "data.id")]
    data_id: Option<String>,
}

/// Always 200, empty body, as fast as possible. Anything that needs
/// the gateway or the database happens after the response is on the
/// wire.
async fn webhook_mercadopago(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
) -> StatusCode {
    let data_id = query.data_id.unwrap_or_default();

    if let Some(secret) = &state.webhook_secret {
        let signature = header(&headers, "x-signature");
        let request_id = header(&headers, "x-request-id");
        if !verify_webhook_signature(secret, &signature, &request_id, &data_id) {
            warn!(data_id, "Webhook signature rejected");
            return StatusCode::OK;
        }
    }

    if query.kind.as_deref() != Some("payment") {
        return StatusCode::OK;
    }
    let Ok(payment_id) = data_id.parse::<i64>() else {
        warn!(data_id, "Webhook payment id is not numeric");
        return StatusCode::OK;
    };

    info!(payment = payment_id, "Webhook accepted");
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move { reconciler.process(payment_id).await });
    StatusCode::OK
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentRequest {
    user_id: String,
    amount: i64,
    duration_days: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentResponse {
    payment_id: i64,
    qr_code_image_base64: String,
    copy_paste_code: String,
}

/// Raw charge creation for operators and external panels. Unlike the
/// deposit flow this takes an explicit duration and opens no channel.
async fn create_payment(
    State(state): State<AppState>,
    Json(req): Json<CreatePaymentRequest>,
) -> ApiResult<Json<CreatePaymentResponse>> {
    if req.user_id.is_empty() {
        return Err(ApiError::Validation("userId must not be empty".to_string()));
    }
    if req.amount <= 0 {
        return Err(ApiError::Validation(format!(
            "amount must be positive, got {}",
            req.amount
        )));
    }
    if req.duration_days <= 0 {
        return Err(ApiError::Validation(format!(
            "durationDays must be positive, got {}",
            req.duration_days
        )));
    }
    let charge = state
        .ctx
        .gateway
        .create_payment(&NewPayment {
            member: MemberId::new(&req.user_id),
            amount_cents: req.amount,
            duration_days: req.duration_days,
            balance_offset_cents: 0,
        })
        .await?;
    Ok(Json(CreatePaymentResponse {
        payment_id: charge.payment_id,
        qr_code_image_base64: charge.qr_code_base64,
        copy_paste_code: charge.copy_paste_code,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    member_id: String,
    name: String,
    contact: String,
}

async fn panel_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<StatusCode> {
    state
        .flows
        .register(
            &MemberId::new(&req.member_id),
            &req.name,
            &req.contact,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepositRequest {
    member_id: String,
    amount_cents: i64,
}

async fn panel_deposit(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<Json<CreatePaymentResponse>> {
    let charge = state
        .flows
        .begin_payment(
            &MemberId::new(&req.member_id),
            req.amount_cents,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(CreatePaymentResponse {
        payment_id: charge.payment_id,
        qr_code_image_base64: charge.qr_code_base64,
        copy_paste_code: charge.copy_paste_code,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedeemRequest {
    member_id: String,
    code: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
enum RedeemResponse {
    #[serde(rename_all = "camelCase")]
    ReferralLinked { referrer: String },
    #[serde(rename_all = "camelCase")]
    BonusDays { new_expiry: String },
    #[serde(rename_all = "camelCase")]
    IndicationTagged { tag: String },
}

async fn panel_redeem(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> ApiResult<Json<RedeemResponse>> {
    let outcome = state
        .flows
        .redeem(
            &MemberId::new(&req.member_id),
            &req.code,
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(match outcome {
        RedeemOutcome::ReferralLinked { referrer } => RedeemResponse::ReferralLinked {
            referrer: referrer.to_string(),
        },
        RedeemOutcome::BonusDays { new_expiry } => RedeemResponse::BonusDays {
            new_expiry: rfc3339(new_expiry),
        },
        RedeemOutcome::IndicationTagged { tag } => RedeemResponse::IndicationTagged { tag },
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    member_id: String,
    name: String,
    contact: String,
    registered_at: String,
    balance_cents: i64,
    last_payment: Option<PaymentView>,
    status: &'static str,
    expires_at: Option<String>,
    days_left: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentView {
    amount_cents: i64,
    paid_at: String,
    reference: String,
}

async fn panel_account(
    State(state): State<AppState>,
    Path(member_id): Path<String>,
) -> ApiResult<Json<AccountResponse>> {
    let summary = state
        .flows
        .account_summary(&MemberId::new(&member_id), OffsetDateTime::now_utc())
        .await?;
    let (status, expires_at, days_left) = match summary.status {
        SubscriptionStatus::Active {
            expires_at,
            days_left,
        } => ("active", Some(rfc3339(expires_at)), Some(days_left)),
        SubscriptionStatus::Expired { expires_at } => {
            ("expired", Some(rfc3339(expires_at)), None)
        }
        SubscriptionStatus::None => ("none", None, None),
    };
    Ok(Json(AccountResponse {
        member_id: summary.member.to_string(),
        name: summary.name,
        contact: summary.contact,
        registered_at: rfc3339(summary.registered_at),
        balance_cents: summary.balance_cents,
        last_payment: summary.last_payment.map(|p| PaymentView {
            amount_cents: p.amount_cents,
            paid_at: rfc3339(p.paid_at),
            reference: p.reference,
        }),
        status,
        expires_at,
        days_left,
    }))
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}
