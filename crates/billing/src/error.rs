//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("webhook signature invalid")]
    SignatureInvalid,

    #[error("'{0}' is not a known plan")]
    PlanUnknown(String),

    #[error("no price configured for plan '{plan}' in {currency}/{interval}")]
    MissingPrice {
        plan: String,
        currency: String,
        interval: String,
    },

    #[error("no subscription found for church {0}")]
    SubscriptionNotFound(Uuid),

    #[error("subscription already exists for church {0}")]
    SubscriptionExists(Uuid),

    #[error("ledger entry {0} not found")]
    LedgerEntryNotFound(Uuid),

    #[error("webhook log {0} not found")]
    WebhookLogNotFound(Uuid),

    #[error("referral already recorded for church {0}")]
    ReferralExists(Uuid),

    #[error("trial length of {0} days is not an allowed option")]
    InvalidTrialDays(u32),

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("missing configuration: {0}")]
    Config(&'static str),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::InvalidPayload(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BillingError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        BillingError::Database(e.to_string())
    }
}
