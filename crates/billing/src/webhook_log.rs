//! Webhook audit log
//!
//! One row per inbound delivery, written before signature verification so
//! even rejected or malformed events are auditable. Rows are never deleted;
//! the stored raw payload is what the operator replay path re-processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Received,
    Processed,
    Failed,
    Rejected,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Received => "received",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
            WebhookStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "received" => Ok(WebhookStatus::Received),
            "processed" => Ok(WebhookStatus::Processed),
            "failed" => Ok(WebhookStatus::Failed),
            "rejected" => Ok(WebhookStatus::Rejected),
            _ => Err(BillingError::InvalidField {
                field: "webhook_status",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub event_type: Option<String>,
    pub reference: Option<String>,
    pub status: WebhookStatus,
    pub error_message: Option<String>,
    /// Raw transport headers, JSON-encoded, for audit and replay.
    pub headers: String,
    /// The untouched request body. Signature verification ran against
    /// exactly these bytes.
    pub payload: String,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait WebhookLogStore: Send + Sync {
    /// Append a `received` row and return its id.
    async fn record_received(
        &self,
        event_type: Option<&str>,
        reference: Option<&str>,
        headers: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Uuid>;

    /// Move a row to its terminal status.
    async fn mark(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn find(&self, id: Uuid) -> BillingResult<Option<WebhookLog>>;
}
