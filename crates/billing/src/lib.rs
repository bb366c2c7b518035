// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Flock Billing Module
//!
//! The subscription billing lifecycle engine: owns money movement and must
//! stay consistent under two independent, concurrently-firing triggers (the
//! scheduled billing batch and the inbound payment webhook).
//!
//! ## Features
//!
//! - **Subscription lifecycle**: trialing, active, past_due, suspended,
//!   cancelled, with grace periods derived at read time
//! - **Billing cycle batch**: daily scan of due subscriptions, free-month
//!   consumption, pending charge creation
//! - **Webhook processing**: raw-body HMAC verification, status-guarded
//!   idempotent settlement, audit log with operator replay
//! - **Referral rewards**: one-shot free-month crediting per referred church
//! - **Feature gate**: per-request allow/deny by state and plan entitlement
//! - **Invariant checks**: runnable consistency queries over the ledger

pub mod config;
pub mod cycle;
pub mod dates;
pub mod error;
pub mod gate;
pub mod invariants;
pub mod ledger;
pub mod plan;
pub mod policy;
pub mod provider;
pub mod referral;
pub mod settlement;
pub mod store;
pub mod subscription;
pub mod subscriptions;
pub mod webhook_log;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod testing;

// Config
pub use config::{BillingConfig, ProviderConfig, ALLOWED_TRIAL_DAYS};

// Cycle
pub use cycle::{BillingCycleProcessor, CycleOutcome, CycleRunSummary};

// Dates
pub use dates::add_interval;

// Error
pub use error::{BillingError, BillingResult};

// Gate
pub use gate::{financially_blocked, is_allowed, visible_modules, FeatureModule};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Ledger
pub use ledger::{
    InvoiceDocument, InvoiceRenderer, LedgerEntry, LedgerEntryStatus, LedgerEntryType,
    LedgerStore, PlanSnapshot,
};

// Plan
pub use plan::{FeatureCategories, Plan, PlanName, PlanPrice, PlanStore};

// Policy
pub use policy::GracePolicy;

// Provider
pub use provider::{ChargeOutcome, ChargeRequest, HttpPaymentProvider, PaymentProvider};

// Referral
pub use referral::{ReferralRecord, ReferralStore, RewardStatus};

// Settlement
pub use settlement::{SettleOutcome, Settlement};

// Subscription
pub use subscription::{
    BillingInterval, PaymentMethod, Subscription, SubscriptionState, SubscriptionStore,
};
pub use subscriptions::SubscriptionsService;

// Webhook log
pub use webhook_log::{WebhookLog, WebhookLogStore, WebhookStatus};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookProcessor, WebhookReplayResult};

use std::sync::Arc;

use sqlx::PgPool;

use crate::store::postgres::{
    PgLedgerStore, PgPlanStore, PgReferralStore, PgSubscriptionStore, PgWebhookLogStore,
};

/// Main billing service wiring the engine against PostgreSQL stores and the
/// HTTP payment provider.
pub struct BillingService {
    pub subscriptions: SubscriptionsService,
    pub cycle: BillingCycleProcessor,
    pub webhooks: WebhookProcessor,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::new(pool, config))
    }

    /// Create a new billing service with explicit config
    pub fn new(pool: PgPool, config: BillingConfig) -> Self {
        let subscriptions: Arc<dyn SubscriptionStore> =
            Arc::new(PgSubscriptionStore::new(pool.clone()));
        let ledger: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
        let referrals: Arc<dyn ReferralStore> = Arc::new(PgReferralStore::new(pool.clone()));
        let plans: Arc<dyn PlanStore> = Arc::new(PgPlanStore::new(pool.clone()));
        let logs: Arc<dyn WebhookLogStore> = Arc::new(PgWebhookLogStore::new(pool.clone()));
        let provider: Arc<dyn PaymentProvider> =
            Arc::new(HttpPaymentProvider::new(config.provider.clone()));

        let policy = GracePolicy::new(config.grace_period_days);
        let settlement = Settlement::new(
            subscriptions.clone(),
            ledger.clone(),
            referrals.clone(),
            policy,
        );

        Self {
            subscriptions: SubscriptionsService::new(
                subscriptions.clone(),
                ledger.clone(),
                plans.clone(),
                referrals.clone(),
                provider.clone(),
                settlement.clone(),
                config.clone(),
            ),
            cycle: BillingCycleProcessor::new(
                subscriptions,
                ledger.clone(),
                referrals,
                plans,
                provider,
                settlement.clone(),
            ),
            webhooks: WebhookProcessor::new(logs, ledger, settlement, config.webhook_secret),
            invariants: InvariantChecker::new(pool),
        }
    }
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
