//! Billing engine configuration
//!
//! Global, tenant-independent settings read from the environment:
//! the webhook shared secret, trial length, grace period, and the
//! payment provider endpoint.

use crate::error::{BillingError, BillingResult};

/// Admin-settable trial lengths. Anything else is rejected at config load.
pub const ALLOWED_TRIAL_DAYS: [u32; 4] = [7, 14, 30, 60];

const DEFAULT_TRIAL_DAYS: u32 = 14;
const DEFAULT_GRACE_PERIOD_DAYS: u32 = 7;
const DEFAULT_EXPIRY_WARNING_DAYS: u32 = 7;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret for webhook HMAC verification.
    pub webhook_secret: String,
    /// Trial length applied at subscription creation.
    pub trial_days: u32,
    /// Days of continued access after a failed charge.
    pub grace_period_days: u32,
    /// How far ahead of the next billing date the renewal warning fires.
    pub expiry_warning_days: u32,
    pub provider: ProviderConfig,
}

/// Payment provider endpoint settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub secret_key: String,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("WEBHOOK_SECRET"))?;

        let trial_days = env_u32("TRIAL_DAYS", DEFAULT_TRIAL_DAYS)?;
        if !ALLOWED_TRIAL_DAYS.contains(&trial_days) {
            return Err(BillingError::InvalidTrialDays(trial_days));
        }

        Ok(Self {
            webhook_secret,
            trial_days,
            grace_period_days: env_u32("GRACE_PERIOD_DAYS", DEFAULT_GRACE_PERIOD_DAYS)?,
            expiry_warning_days: env_u32("EXPIRY_WARNING_DAYS", DEFAULT_EXPIRY_WARNING_DAYS)?,
            provider: ProviderConfig::from_env()?,
        })
    }
}

impl ProviderConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            base_url: std::env::var("PAYMENT_PROVIDER_URL")
                .map_err(|_| BillingError::Config("PAYMENT_PROVIDER_URL"))?,
            secret_key: std::env::var("PAYMENT_PROVIDER_SECRET")
                .map_err(|_| BillingError::Config("PAYMENT_PROVIDER_SECRET"))?,
        })
    }
}

fn env_u32(name: &'static str, default: u32) -> BillingResult<u32> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| BillingError::InvalidField {
            field: name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}
