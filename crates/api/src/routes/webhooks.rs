//! Payment provider webhook endpoint
//!
//! The handler hands the untouched request bytes to the processor; any
//! intermediate JSON re-serialization would break the HMAC check. The
//! event is acknowledged once durably logged, even if downstream
//! processing fails, so the provider only retries transport failures.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use flock_billing::WebhookDisposition;
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-flock-signature";

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let headers_json = headers_as_json(&headers);
    let disposition = state
        .billing
        .webhooks
        .process(&body, signature, &headers_json)
        .await?;

    match disposition {
        WebhookDisposition::Acknowledged => {
            Ok((StatusCode::OK, Json(json!({ "received": true }))))
        }
        WebhookDisposition::Rejected => Err(ApiError::Unauthorized),
    }
}

/// Flatten transport headers into a JSON object string for the audit log.
fn headers_as_json(headers: &HeaderMap) -> String {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                json!(value.to_str().unwrap_or("<binary>")),
            )
        })
        .collect();
    serde_json::Value::Object(map).to_string()
}
