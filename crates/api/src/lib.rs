#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Portaria API server library.
//!
//! HTTP ingress for the membership engine: the payment-gateway webhook,
//! payment creation, and the panel endpoints. Everything of substance
//! lives in `portaria-membership`; the handlers here stay thin.

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
