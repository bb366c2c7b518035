//! Subscription management operations
//!
//! The request-path operations around the state machine: trial creation,
//! scheduled plan changes, cancellation, payment-method registration,
//! checkout initiation, referral linking, and the renewal-warning sweep.
//! The lifecycle transitions themselves belong to the cycle processor and
//! the webhook processor.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, LedgerStore, PlanSnapshot};
use crate::plan::{PlanName, PlanStore};
use crate::provider::{ChargeOutcome, ChargeRequest, PaymentProvider};
use crate::referral::{ReferralRecord, ReferralStore};
use crate::settlement::Settlement;
use crate::subscription::{
    BillingInterval, PaymentMethod, Subscription, SubscriptionState, SubscriptionStore,
};

#[derive(Clone)]
pub struct SubscriptionsService {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn LedgerStore>,
    plans: Arc<dyn PlanStore>,
    referrals: Arc<dyn ReferralStore>,
    provider: Arc<dyn PaymentProvider>,
    settlement: Settlement,
    config: BillingConfig,
}

impl SubscriptionsService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn LedgerStore>,
        plans: Arc<dyn PlanStore>,
        referrals: Arc<dyn ReferralStore>,
        provider: Arc<dyn PaymentProvider>,
        settlement: Settlement,
        config: BillingConfig,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            plans,
            referrals,
            provider,
            settlement,
            config,
        }
    }

    pub async fn find(&self, church_id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .find_by_church(church_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(church_id))
    }

    /// Catalog lookup for the feature gate's visibility decision.
    pub async fn plan_details(&self, name: PlanName) -> BillingResult<Option<crate::plan::Plan>> {
        self.plans.find(name).await
    }

    /// All ledger entries for a church, newest first.
    pub async fn invoices(&self, church_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        self.ledger.list_for_church(church_id).await
    }

    /// One ledger entry, verified to belong to the church.
    pub async fn invoice(&self, church_id: Uuid, entry_id: Uuid) -> BillingResult<LedgerEntry> {
        let entry = self
            .ledger
            .find(entry_id)
            .await?
            .ok_or(BillingError::LedgerEntryNotFound(entry_id))?;
        if entry.church_id != church_id {
            return Err(BillingError::LedgerEntryNotFound(entry_id));
        }
        Ok(entry)
    }

    /// Start a trial. The trial length is the global admin-settable
    /// setting; the first billing attempt lands when the trial ends.
    pub async fn create_trial(
        &self,
        church_id: Uuid,
        currency: &str,
        interval: BillingInterval,
    ) -> BillingResult<Subscription> {
        if self
            .subscriptions
            .find_by_church(church_id)
            .await?
            .is_some()
        {
            return Err(BillingError::SubscriptionExists(church_id));
        }

        let now = OffsetDateTime::now_utc();
        let trial_end = now + Duration::days(i64::from(self.config.trial_days));
        let sub = Subscription {
            id: Uuid::new_v4(),
            church_id,
            state: SubscriptionState::Trialing,
            plan: None,
            pending_plan: None,
            trial_start: Some(now),
            trial_end: Some(trial_end),
            billing_interval: interval,
            next_billing_date: trial_end,
            currency: currency.to_string(),
            grace_period_end: None,
            free_months_earned: 0,
            free_months_used: 0,
            expiry_warning_shown: false,
            expiry_warning_notified_at: None,
            payment_methods: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.subscriptions.create(&sub).await?;

        tracing::info!(
            church_id = %church_id,
            trial_days = self.config.trial_days,
            trial_end = %trial_end,
            "Trial subscription created"
        );
        Ok(sub)
    }

    /// Schedule a plan change. During trial the plan applies immediately
    /// (nothing was billed yet); otherwise it is deferred to the next
    /// billing boundary via the pending-plan slot.
    pub async fn schedule_plan_change(
        &self,
        church_id: Uuid,
        plan: PlanName,
    ) -> BillingResult<Subscription> {
        let mut sub = self.find(church_id).await?;
        if sub.state == SubscriptionState::Trialing {
            sub.plan = Some(plan);
            sub.pending_plan = None;
        } else {
            sub.pending_plan = Some(plan);
        }
        self.subscriptions.update(&sub).await?;
        tracing::info!(church_id = %church_id, plan = %plan, "Plan change scheduled");
        Ok(sub)
    }

    pub async fn cancel(&self, church_id: Uuid) -> BillingResult<Subscription> {
        let mut sub = self.find(church_id).await?;
        sub.state = SubscriptionState::Cancelled;
        sub.grace_period_end = None;
        self.subscriptions.update(&sub).await?;
        tracing::info!(church_id = %church_id, "Subscription cancelled");
        Ok(sub)
    }

    /// Register a payment-method descriptor, deduplicated by fingerprint.
    /// Returns whether the method was new.
    pub async fn add_payment_method(
        &self,
        church_id: Uuid,
        method: PaymentMethod,
    ) -> BillingResult<bool> {
        let mut sub = self.find(church_id).await?;
        let added = sub.add_payment_method(method);
        if added {
            self.subscriptions.update(&sub).await?;
        }
        Ok(added)
    }

    /// Create and initiate an out-of-cycle charge for a plan, e.g. a
    /// trial-to-paid checkout. The pending entry snapshots the plan terms;
    /// settlement applies them to the subscription.
    pub async fn initiate_checkout(
        &self,
        church_id: Uuid,
        plan: PlanName,
        interval: BillingInterval,
    ) -> BillingResult<LedgerEntry> {
        let sub = self.find(church_id).await?;
        let amount_cents = self
            .plans
            .price(plan, &sub.currency, interval)
            .await?
            .ok_or_else(|| BillingError::MissingPrice {
                plan: plan.to_string(),
                currency: sub.currency.clone(),
                interval: interval.as_str().to_string(),
            })?;

        let now = OffsetDateTime::now_utc();
        let entry = LedgerEntry::pending_payment(
            church_id,
            PlanSnapshot {
                plan,
                interval,
                amount_cents,
                currency: sub.currency.clone(),
            },
            now,
        );
        self.ledger.append(&entry).await?;

        match self
            .provider
            .charge(&ChargeRequest {
                church_id,
                ledger_entry_id: entry.id,
                amount_cents,
                currency: sub.currency.clone(),
            })
            .await?
        {
            ChargeOutcome::Accepted { reference } => {
                self.ledger
                    .set_provider_reference(entry.id, &reference)
                    .await?;
            }
            ChargeOutcome::Settled { reference, success } => {
                if success {
                    self.settlement
                        .apply_success(&entry, &reference, None, now)
                        .await?;
                } else {
                    self.ledger
                        .set_provider_reference(entry.id, &reference)
                        .await?;
                    self.settlement.apply_failure(&entry, now).await?;
                }
            }
        }

        tracing::info!(
            church_id = %church_id,
            plan = %plan,
            amount_cents = amount_cents,
            "Checkout initiated"
        );
        self.ledger
            .find(entry.id)
            .await?
            .ok_or(BillingError::LedgerEntryNotFound(entry.id))
    }

    /// Record a referral relationship; one per referred church, ever.
    pub async fn link_referral(
        &self,
        referrer_church: Uuid,
        referred_church: Uuid,
    ) -> BillingResult<ReferralRecord> {
        self.referrals
            .link(referrer_church, referred_church, OffsetDateTime::now_utc())
            .await
    }

    /// Flag subscriptions approaching their billing date whose one-shot
    /// warning latch is unset. Returns how many were flagged. The actual
    /// notification delivery lives outside this engine.
    pub async fn sweep_expiry_warnings(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let cutoff = now + Duration::days(i64::from(self.config.expiry_warning_days));
        let candidates = self.subscriptions.expiry_warning_candidates(cutoff).await?;
        let mut flagged = 0;
        for sub in candidates {
            if self
                .subscriptions
                .mark_expiry_warning_shown(sub.church_id, now)
                .await?
            {
                flagged += 1;
                tracing::info!(
                    church_id = %sub.church_id,
                    next_billing_date = %sub.next_billing_date,
                    "Renewal warning flagged"
                );
            }
        }
        Ok(flagged)
    }
}
