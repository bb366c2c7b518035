//! Billing cycle processor
//!
//! The scheduled batch half of the engine. Scans subscriptions due for
//! billing, satisfies each cycle with an earned free month when one is
//! available, otherwise writes a pending charge and initiates it with the
//! provider. Each subscription is an independent unit of work; one failure
//! never aborts the run. Safe to invoke more than once per day: billing a
//! subscription advances `next_billing_date`, so a rerun no longer selects
//! it.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::dates::add_interval;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, LedgerStore, PlanSnapshot};
use crate::plan::PlanStore;
use crate::provider::{ChargeOutcome, ChargeRequest, PaymentProvider};
use crate::referral::ReferralStore;
use crate::settlement::Settlement;
use crate::subscription::{Subscription, SubscriptionStore};

/// What the cycle did for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not charged; the cycle was funded by an earned free month.
    FreeMonth,
    /// A pending charge was written and initiated.
    Charged { amount_cents: i64 },
    /// Nothing billable this run (no plan on file, or no catalog price).
    Skipped { reason: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleRunSummary {
    pub scanned: usize,
    pub free_months: usize,
    pub charged: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct BillingCycleProcessor {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn LedgerStore>,
    referrals: Arc<dyn ReferralStore>,
    plans: Arc<dyn PlanStore>,
    provider: Arc<dyn PaymentProvider>,
    settlement: Settlement,
}

impl BillingCycleProcessor {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn LedgerStore>,
        referrals: Arc<dyn ReferralStore>,
        plans: Arc<dyn PlanStore>,
        provider: Arc<dyn PaymentProvider>,
        settlement: Settlement,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            referrals,
            plans,
            provider,
            settlement,
        }
    }

    /// The daily batch entry point, invoked by an external scheduler.
    pub async fn run_daily_billing_job(&self) -> CycleRunSummary {
        let now = OffsetDateTime::now_utc();
        self.run_at(now).await
    }

    /// Run the batch against an explicit clock.
    pub async fn run_at(&self, now: OffsetDateTime) -> CycleRunSummary {
        let mut summary = CycleRunSummary::default();

        let due = match self.subscriptions.due_for_billing(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to scan subscriptions due for billing");
                summary.errors = 1;
                return summary;
            }
        };
        summary.scanned = due.len();

        for sub in due {
            match self.bill_subscription(&sub, now).await {
                Ok(CycleOutcome::FreeMonth) => summary.free_months += 1,
                Ok(CycleOutcome::Charged { .. }) => summary.charged += 1,
                Ok(CycleOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        church_id = %sub.church_id,
                        error = %e,
                        "Failed to bill subscription"
                    );
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            free_months = summary.free_months,
            charged = summary.charged,
            skipped = summary.skipped,
            errors = summary.errors,
            "Billing cycle run complete"
        );
        summary
    }

    /// Bill one due subscription.
    pub async fn bill_subscription(
        &self,
        sub: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<CycleOutcome> {
        let advanced = add_interval(sub.next_billing_date, sub.billing_interval);

        // Earned balance first; this path never touches the plan catalog.
        if self
            .subscriptions
            .consume_free_month(sub.church_id, advanced)
            .await?
        {
            self.ledger
                .append(&LedgerEntry::free_month(sub.church_id, &sub.currency, now))
                .await?;
            self.referrals
                .mark_oldest_reward_consumed(sub.church_id)
                .await?;
            self.subscriptions
                .promote_pending_plan(sub.church_id)
                .await?;
            tracing::info!(
                church_id = %sub.church_id,
                "Billing cycle satisfied by free month, not charged"
            );
            return Ok(CycleOutcome::FreeMonth);
        }

        let outcome = self.charge_subscription(sub, advanced, now).await?;
        // Scheduled plan changes become effective on the billing boundary,
        // never mid-period.
        self.subscriptions
            .promote_pending_plan(sub.church_id)
            .await?;
        Ok(outcome)
    }

    async fn charge_subscription(
        &self,
        sub: &Subscription,
        advanced: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<CycleOutcome> {
        let Some(plan) = sub.plan else {
            tracing::warn!(
                church_id = %sub.church_id,
                "Subscription due with no plan on file, skipping charge"
            );
            return Ok(CycleOutcome::Skipped { reason: "no_plan" });
        };

        let Some(amount_cents) = self
            .plans
            .price(plan, &sub.currency, sub.billing_interval)
            .await?
        else {
            // Never charge an undefined amount; retry on the next run once
            // the catalog is fixed.
            tracing::warn!(
                church_id = %sub.church_id,
                plan = %plan,
                currency = %sub.currency,
                interval = sub.billing_interval.as_str(),
                "No price configured, skipping charge this cycle"
            );
            return Ok(CycleOutcome::Skipped {
                reason: "missing_price",
            });
        };

        let entry = LedgerEntry::pending_payment(
            sub.church_id,
            PlanSnapshot {
                plan,
                interval: sub.billing_interval,
                amount_cents,
                currency: sub.currency.clone(),
            },
            now,
        );
        self.ledger.append(&entry).await?;

        // Advance the schedule off the old date before the charge settles;
        // this is what makes a same-day rerun a no-op.
        let mut updated = sub.clone();
        updated.next_billing_date = advanced;
        self.subscriptions.update(&updated).await?;

        self.initiate_charge(sub.church_id, &entry, now).await?;

        Ok(CycleOutcome::Charged { amount_cents })
    }

    /// Hand the pending entry to the provider. Settlement is normally
    /// asynchronous via the webhook; providers without webhooks settle in
    /// the response and take the same transition here.
    async fn initiate_charge(
        &self,
        church_id: Uuid,
        entry: &LedgerEntry,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let request = ChargeRequest {
            church_id,
            ledger_entry_id: entry.id,
            amount_cents: entry.amount_cents,
            currency: entry.currency.clone(),
        };

        match self.provider.charge(&request).await {
            Ok(ChargeOutcome::Accepted { reference }) => {
                self.ledger
                    .set_provider_reference(entry.id, &reference)
                    .await?;
                tracing::info!(
                    church_id = %church_id,
                    entry_id = %entry.id,
                    reference = %reference,
                    "Charge initiated, awaiting webhook settlement"
                );
            }
            Ok(ChargeOutcome::Settled { reference, success }) => {
                if success {
                    self.settlement
                        .apply_success(entry, &reference, None, now)
                        .await?;
                } else {
                    self.ledger
                        .set_provider_reference(entry.id, &reference)
                        .await?;
                    self.settlement.apply_failure(entry, now).await?;
                }
            }
            Err(BillingError::Provider(message)) => {
                tracing::warn!(
                    church_id = %church_id,
                    entry_id = %entry.id,
                    error = %message,
                    "Charge initiation failed"
                );
                self.settlement.apply_failure(entry, now).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
