//! Tenant-facing billing routes
//!
//! Subscription management, the feature-gate check consulted before gated
//! writes, and invoice downloads through the renderer seam.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use flock_billing::{
    financially_blocked, is_allowed, visible_modules, BillingInterval, FeatureModule,
    InvoiceDocument, PaymentMethod, PlanName,
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTrialRequest {
    pub currency: String,
    pub billing_interval: BillingInterval,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: PlanName,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: PlanName,
    pub billing_interval: BillingInterval,
}

/// The feature-gate decision. Financially blocked tenants get the single
/// payment-required signal regardless of whether they are past_due or
/// suspended; plan-entitlement misses come back as `allowed: false`.
pub async fn check_access(
    State(state): State<AppState>,
    Path((church_id, module)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let module = FeatureModule::parse(&module)?;
    let sub = state.billing.subscriptions.find(church_id).await?;
    let now = OffsetDateTime::now_utc();

    if financially_blocked(&sub, now) {
        return Err(ApiError::PaymentRequired);
    }

    let plan = match sub.plan {
        Some(name) => state.billing.subscriptions.plan_details(name).await?,
        None => None,
    };

    Ok(Json(json!({
        "allowed": is_allowed(&sub, module, now),
        "visible_modules": visible_modules(&sub, plan.as_ref()),
    })))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state.billing.subscriptions.find(church_id).await?;
    Ok(Json(sub))
}

pub async fn create_trial(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
    Json(request): Json<CreateTrialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state
        .billing
        .subscriptions
        .create_trial(church_id, &request.currency, request.billing_interval)
        .await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
    Json(request): Json<ChangePlanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state
        .billing
        .subscriptions
        .schedule_plan_change(church_id, request.plan)
        .await?;
    Ok(Json(sub))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state.billing.subscriptions.cancel(church_id).await?;
    Ok(Json(sub))
}

pub async fn initiate_checkout(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .billing
        .subscriptions
        .initiate_checkout(church_id, request.plan, request.billing_interval)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn add_payment_method(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
    Json(method): Json<PaymentMethod>,
) -> Result<impl IntoResponse, ApiError> {
    let added = state
        .billing
        .subscriptions
        .add_payment_method(church_id, method)
        .await?;
    Ok(Json(json!({ "added": added })))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Path(church_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state.billing.subscriptions.invoices(church_id).await?;
    Ok(Json(entries))
}

/// Render one ledger entry through the stateless invoice renderer.
pub async fn download_invoice(
    State(state): State<AppState>,
    Path((church_id, entry_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .billing
        .subscriptions
        .invoice(church_id, entry_id)
        .await?;
    let document = InvoiceDocument::from_entry(&entry);
    let bytes = state.renderer.render(&document)?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"invoice-{entry_id}.json\""),
            ),
        ],
        bytes,
    ))
}
