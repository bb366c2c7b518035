//! Payment webhook processing
//!
//! The asynchronous half of the engine, concurrent with the billing cycle
//! batch. Every inbound delivery is logged before verification, verified
//! against the untouched raw bytes, settled through the status-guarded
//! ledger transition, and acknowledged. Application-level failures are
//! recorded on the log row and still acknowledged, so the provider never
//! replays an event because of a bug on our side; the operator replays
//! from the log instead.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, LedgerStore, PlanSnapshot};
use crate::plan::PlanName;
use crate::settlement::Settlement;
use crate::subscription::BillingInterval;
use crate::webhook_log::{WebhookLogStore, WebhookStatus};

type HmacSha512 = Hmac<Sha512>;

/// How the handler answered the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Event durably logged; respond 2xx regardless of downstream outcome.
    Acknowledged,
    /// Signature mismatch; respond unauthorized.
    Rejected,
}

/// Result of an operator-initiated replay from the audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub log_id: Uuid,
    pub status: WebhookStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    event: String,
    data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
struct ProviderEventData {
    reference: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    metadata: Option<EventMetadata>,
}

#[derive(Debug, Deserialize)]
struct EventMetadata {
    #[serde(default)]
    ledger_entry_id: Option<Uuid>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    billing_interval: Option<String>,
}

enum EventOutcome {
    Success,
    Failure,
    Unhandled,
}

impl ProviderEvent {
    fn outcome(&self) -> EventOutcome {
        match self.event.as_str() {
            "charge.success" => EventOutcome::Success,
            "charge.failed" => EventOutcome::Failure,
            _ => EventOutcome::Unhandled,
        }
    }

    /// Plan terms carried on the event itself, used only when the matched
    /// entry has no snapshot of its own.
    fn fallback_snapshot(&self) -> Option<PlanSnapshot> {
        let metadata = self.data.metadata.as_ref()?;
        let plan = PlanName::parse(metadata.plan.as_deref()?).ok()?;
        let interval = BillingInterval::parse(metadata.billing_interval.as_deref()?).ok()?;
        Some(PlanSnapshot {
            plan,
            interval,
            amount_cents: self.data.amount?,
            currency: self.data.currency.clone()?,
        })
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    logs: Arc<dyn WebhookLogStore>,
    ledger: Arc<dyn LedgerStore>,
    settlement: Settlement,
    webhook_secret: String,
}

impl WebhookProcessor {
    pub fn new(
        logs: Arc<dyn WebhookLogStore>,
        ledger: Arc<dyn LedgerStore>,
        settlement: Settlement,
        webhook_secret: String,
    ) -> Self {
        Self {
            logs,
            ledger,
            settlement,
            webhook_secret,
        }
    }

    /// Recompute the HMAC over the exact raw transport body and compare in
    /// constant time. Any re-serialization of a parsed body would break
    /// legitimate signatures.
    pub fn verify_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let Ok(mut mac) = HmacSha512::new_from_slice(self.webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        let computed = hex::encode(mac.finalize().into_bytes());
        computed
            .as_bytes()
            .ct_eq(signature.trim().as_bytes())
            .into()
    }

    /// Handle one inbound delivery.
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        headers: &str,
    ) -> BillingResult<WebhookDisposition> {
        let now = OffsetDateTime::now_utc();
        let payload = String::from_utf8_lossy(raw_body);

        // Best-effort labels for the audit row; the event is not trusted
        // until the signature checks out.
        let preview: Option<ProviderEvent> = serde_json::from_slice(raw_body).ok();
        let log_id = self
            .logs
            .record_received(
                preview.as_ref().map(|e| e.event.as_str()),
                preview.as_ref().map(|e| e.data.reference.as_str()),
                headers,
                &payload,
                now,
            )
            .await?;

        let verified = signature.is_some_and(|sig| self.verify_signature(raw_body, sig));
        if !verified {
            self.logs
                .mark(
                    log_id,
                    WebhookStatus::Rejected,
                    Some("signature mismatch"),
                    now,
                )
                .await?;
            tracing::warn!(log_id = %log_id, "Webhook rejected: signature mismatch");
            return Ok(WebhookDisposition::Rejected);
        }

        match self.apply_event(raw_body, now).await {
            Ok(()) => {
                self.logs
                    .mark(log_id, WebhookStatus::Processed, None, now)
                    .await?;
            }
            Err(e) => {
                // Acknowledge anyway: provider retries are for transport
                // failures, not application bugs. The log row is the
                // recovery mechanism.
                tracing::error!(log_id = %log_id, error = %e, "Webhook processing failed");
                self.logs
                    .mark(log_id, WebhookStatus::Failed, Some(&e.to_string()), now)
                    .await?;
            }
        }
        Ok(WebhookDisposition::Acknowledged)
    }

    /// Re-run a logged event's processing steps, without signature
    /// verification: the operator vouches for the stored payload.
    pub async fn replay(&self, log_id: Uuid) -> BillingResult<WebhookReplayResult> {
        let log = self
            .logs
            .find(log_id)
            .await?
            .ok_or(BillingError::WebhookLogNotFound(log_id))?;
        let now = OffsetDateTime::now_utc();

        let (status, error_message) = match self.apply_event(log.payload.as_bytes(), now).await {
            Ok(()) => (WebhookStatus::Processed, None),
            Err(e) => (WebhookStatus::Failed, Some(e.to_string())),
        };
        self.logs
            .mark(log_id, status, error_message.as_deref(), now)
            .await?;

        tracing::info!(log_id = %log_id, status = status.as_str(), "Webhook replay finished");
        Ok(WebhookReplayResult {
            log_id,
            status,
            error_message,
        })
    }

    /// Parse, correlate, settle. Errors here mark the log row `failed`;
    /// the delivery is still acknowledged.
    async fn apply_event(&self, raw_body: &[u8], now: OffsetDateTime) -> BillingResult<()> {
        let event: ProviderEvent = serde_json::from_slice(raw_body)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

        let outcome = match event.outcome() {
            EventOutcome::Unhandled => {
                tracing::info!(event_type = %event.event, "Unhandled webhook event type");
                return Ok(());
            }
            other => other,
        };

        let Some(entry) = self.locate_entry(&event).await? else {
            // May belong to another system or a stale test event.
            tracing::info!(
                reference = %event.data.reference,
                "Webhook references no known ledger entry, ignoring"
            );
            return Ok(());
        };

        match outcome {
            EventOutcome::Success => {
                let fallback = event.fallback_snapshot();
                self.settlement
                    .apply_success(&entry, &event.data.reference, fallback, now)
                    .await?;
            }
            EventOutcome::Failure => {
                self.settlement.apply_failure(&entry, now).await?;
            }
            EventOutcome::Unhandled => {}
        }
        Ok(())
    }

    /// Correlation id first, provider reference (most recent first) as the
    /// fallback for providers that strip metadata.
    async fn locate_entry(&self, event: &ProviderEvent) -> BillingResult<Option<LedgerEntry>> {
        if let Some(id) = event.data.metadata.as_ref().and_then(|m| m.ledger_entry_id) {
            if let Some(entry) = self.ledger.find(id).await? {
                return Ok(Some(entry));
            }
        }
        self.ledger.find_by_reference(&event.data.reference).await
    }
}

#[cfg(test)]
mod signature_tests {
    use super::*;
    use crate::policy::GracePolicy;
    use crate::store::memory::{
        MemoryLedgerStore, MemoryReferralStore, MemorySubscriptionStore, MemoryWebhookLogStore,
    };

    fn processor(secret: &str) -> WebhookProcessor {
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let settlement = Settlement::new(
            Arc::new(MemorySubscriptionStore::new()),
            ledger.clone(),
            Arc::new(MemoryReferralStore::new()),
            GracePolicy::new(7),
        );
        WebhookProcessor::new(
            Arc::new(MemoryWebhookLogStore::new()),
            ledger,
            settlement,
            secret.to_string(),
        )
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let p = processor("whsec_test");
        let body = br#"{"event":"charge.success","data":{"reference":"ref_1"}}"#;
        assert!(p.verify_signature(body, &sign("whsec_test", body)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let p = processor("whsec_test");
        let body = br#"{"event":"charge.success","data":{"reference":"ref_1"}}"#;
        assert!(!p.verify_signature(body, &sign("other_secret", body)));
    }

    #[test]
    fn modified_payload_is_rejected() {
        let p = processor("whsec_test");
        let body = br#"{"event":"charge.success","data":{"reference":"ref_1"}}"#;
        let tampered = br#"{"event":"charge.success","data":{"reference":"ref_2"}}"#;
        assert!(!p.verify_signature(tampered, &sign("whsec_test", body)));
    }

    #[test]
    fn signature_covers_raw_bytes_not_reserialized_json() {
        let p = processor("whsec_test");
        // Same JSON value, different byte layout.
        let spaced = br#"{ "event": "charge.success", "data": { "reference": "ref_1" } }"#;
        let compact = br#"{"event":"charge.success","data":{"reference":"ref_1"}}"#;
        assert!(p.verify_signature(spaced, &sign("whsec_test", spaced)));
        assert!(!p.verify_signature(compact, &sign("whsec_test", spaced)));
    }
}
