//! HTTP error mapping for the membership engine.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use portaria_membership::MembershipError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    /// Rejected input; the message is safe to show the caller.
    Validation(String),
    NotFound(String),
    /// The payment gateway could not be reached or answered badly.
    Gateway(String),
    /// Store or directory trouble; the caller should retry later.
    Internal(String),
}

impl From<MembershipError> for ApiError {
    fn from(e: MembershipError) -> Self {
        match e {
            MembershipError::InvalidAmount(_)
            | MembershipError::InvalidCoupon(_)
            | MembershipError::CouponAlreadyUsed(_)
            | MembershipError::AlreadyRegistered(_)
            | MembershipError::AlreadySubscribed(_)
            | MembershipError::NotRegistered(_)
            | MembershipError::InvalidInput(_) => ApiError::Validation(e.to_string()),
            MembershipError::MemberNotFound(_) => ApiError::NotFound(e.to_string()),
            MembershipError::Gateway(_) => ApiError::Gateway(e.to_string()),
            MembershipError::DirectoryUnavailable(_)
            | MembershipError::Store(_)
            | MembershipError::Feed(_)
            | MembershipError::DuplicatePayment(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Gateway(message) => {
                tracing::error!(error = %message, "Gateway failure surfaced to caller");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "payment gateway unavailable, try again later".to_string(),
                )
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal failure surfaced to caller");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "temporary failure, try again later".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
