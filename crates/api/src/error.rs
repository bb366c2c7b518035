//! API error responses
//!
//! Maps engine errors onto HTTP statuses. The only failure surface tenant
//! users ever see from the gate is a single 402 payment-required signal,
//! with no distinction between past_due and suspended.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flock_billing::BillingError;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    PaymentRequired,
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::SignatureInvalid => ApiError::Unauthorized,
            BillingError::SubscriptionNotFound(_)
            | BillingError::LedgerEntryNotFound(_)
            | BillingError::WebhookLogNotFound(_) => ApiError::NotFound(e.to_string()),
            BillingError::PlanUnknown(_)
            | BillingError::MissingPrice { .. }
            | BillingError::InvalidTrialDays(_)
            | BillingError::InvalidPayload(_)
            | BillingError::InvalidField { .. }
            | BillingError::SubscriptionExists(_)
            | BillingError::ReferralExists(_) => ApiError::BadRequest(e.to_string()),
            BillingError::Provider(_) | BillingError::Config(_) | BillingError::Database(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::PaymentRequired => {
                (StatusCode::PAYMENT_REQUIRED, "payment required".to_string())
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
