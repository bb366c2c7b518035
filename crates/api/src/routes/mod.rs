//! HTTP routes

pub mod admin;
pub mod churches;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Payment provider webhook: raw body, signature header.
        .route("/webhooks/payments", post(webhooks::receive))
        // Tenant-facing billing surface.
        .route(
            "/churches/{church_id}/access/{module}",
            get(churches::check_access),
        )
        .route(
            "/churches/{church_id}/subscription",
            get(churches::get_subscription).delete(churches::cancel_subscription),
        )
        .route(
            "/churches/{church_id}/subscription/trial",
            post(churches::create_trial),
        )
        .route(
            "/churches/{church_id}/subscription/plan",
            post(churches::change_plan),
        )
        .route(
            "/churches/{church_id}/checkout",
            post(churches::initiate_checkout),
        )
        .route(
            "/churches/{church_id}/payment-methods",
            post(churches::add_payment_method),
        )
        .route("/churches/{church_id}/invoices", get(churches::list_invoices))
        .route(
            "/churches/{church_id}/invoices/{entry_id}/download",
            get(churches::download_invoice),
        )
        // Operator tooling.
        .route("/admin/billing/invariants", get(admin::run_invariants))
        .route("/admin/billing/run-cycle", post(admin::run_billing_cycle))
        .route("/admin/webhooks/{log_id}/replay", post(admin::replay_webhook))
        .route("/admin/referrals", post(admin::link_referral))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
