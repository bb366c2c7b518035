//! Operator tooling routes
//!
//! Invariant checks, the external billing-cycle trigger, webhook replay
//! from the audit log, and referral linking.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn run_invariants(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state.billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

/// Manual trigger for the daily billing batch. Idempotent within a day:
/// billed subscriptions no longer match the due filter.
pub async fn run_billing_cycle(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.billing.cycle.run_daily_billing_job().await;
    Json(summary)
}

/// Re-process a logged webhook after an application-level failure.
pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(log_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state.billing.webhooks.replay(log_id).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct LinkReferralRequest {
    pub referrer_church: Uuid,
    pub referred_church: Uuid,
}

pub async fn link_referral(
    State(state): State<AppState>,
    Json(request): Json<LinkReferralRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .billing
        .subscriptions
        .link_referral(request.referrer_church, request.referred_church)
        .await?;
    Ok((axum::http::StatusCode::CREATED, Json(record)))
}
