//! Payment provider client
//!
//! The provider is an external service with a request/response contract for
//! initiating charges and an asynchronous webhook contract for settlement.
//! Providers without webhooks settle synchronously in the charge response;
//! both shapes are expressed in [`ChargeOutcome`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub church_id: Uuid,
    /// Correlation id echoed back in webhook metadata.
    pub ledger_entry_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// Charge accepted; settlement arrives later on the webhook.
    Accepted { reference: String },
    /// Provider settled synchronously.
    Settled { reference: String, success: bool },
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeOutcome>;
}

/// HTTP client for the provider's charge API.
#[derive(Clone)]
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct ChargeBody<'a> {
    amount: i64,
    currency: &'a str,
    metadata: ChargeMetadata,
}

#[derive(Debug, Serialize)]
struct ChargeMetadata {
    church_id: Uuid,
    ledger_entry_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    status: String,
    reference: String,
}

impl HttpPaymentProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeOutcome> {
        let url = format!("{}/charges", self.config.base_url.trim_end_matches('/'));
        let body = ChargeBody {
            amount: request.amount_cents,
            currency: &request.currency,
            metadata: ChargeMetadata {
                church_id: request.church_id,
                ledger_entry_id: request.ledger_entry_id,
            },
        };

        // Transport-level retries only; a definitive provider response is
        // never retried.
        let strategy = ExponentialBackoff::from_millis(200).take(2);
        let response = Retry::spawn(strategy, || async {
            self.client
                .post(&url)
                .bearer_auth(&self.config.secret_key)
                .json(&body)
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|e| BillingError::Provider(e.to_string()))?;

        let parsed: ChargeResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Provider(e.to_string()))?;

        match parsed.status.as_str() {
            "accepted" | "queued" => Ok(ChargeOutcome::Accepted {
                reference: parsed.reference,
            }),
            "success" => Ok(ChargeOutcome::Settled {
                reference: parsed.reference,
                success: true,
            }),
            "failed" => Ok(ChargeOutcome::Settled {
                reference: parsed.reference,
                success: false,
            }),
            other => Err(BillingError::Provider(format!(
                "unrecognized charge status '{other}'"
            ))),
        }
    }
}
