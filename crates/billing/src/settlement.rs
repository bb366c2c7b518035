//! Payment settlement
//!
//! The one place a charge outcome is applied. Both the webhook processor
//! and the synchronous provider path route through here, so the
//! status-guarded ledger transition and the follow-on subscription and
//! referral mutations cannot diverge between the two triggers.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::dates::add_interval;
use crate::error::BillingResult;
use crate::ledger::{LedgerEntry, LedgerEntryStatus, LedgerStore, PlanSnapshot};
use crate::policy::GracePolicy;
use crate::referral::ReferralStore;
use crate::subscription::{SubscriptionState, SubscriptionStore};

/// What the status guard decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// This caller won the `pending -> terminal` transition.
    Applied,
    /// The entry already carried the matching terminal status; duplicate
    /// delivery, nothing mutated.
    AlreadySettled,
    /// The entry settled to the opposite outcome first; the late event is
    /// dropped as a no-op.
    Superseded,
}

#[derive(Clone)]
pub struct Settlement {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn LedgerStore>,
    referrals: Arc<dyn ReferralStore>,
    policy: GracePolicy,
}

impl Settlement {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn LedgerStore>,
        referrals: Arc<dyn ReferralStore>,
        policy: GracePolicy,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            referrals,
            policy,
        }
    }

    /// Apply a successful charge. `fallback_snapshot` is event metadata
    /// used only when the entry itself carries no snapshot.
    pub async fn apply_success(
        &self,
        entry: &LedgerEntry,
        provider_reference: &str,
        fallback_snapshot: Option<PlanSnapshot>,
        now: OffsetDateTime,
    ) -> BillingResult<SettleOutcome> {
        let won = self
            .ledger
            .settle(
                entry.id,
                LedgerEntryStatus::Paid,
                Some(provider_reference),
                now,
            )
            .await?;
        if !won {
            return self.lost_settlement(entry.id, LedgerEntryStatus::Paid).await;
        }

        let Some(mut sub) = self.subscriptions.find_by_church(entry.church_id).await? else {
            // The money is settled either way; flag the orphan for ops.
            tracing::error!(
                church_id = %entry.church_id,
                entry_id = %entry.id,
                "Payment settled for a church with no subscription record"
            );
            return Ok(SettleOutcome::Applied);
        };

        sub.state = SubscriptionState::Active;
        sub.grace_period_end = None;
        sub.expiry_warning_shown = false;
        // First paid conversion ends the trial for good.
        sub.trial_start = None;
        sub.trial_end = None;

        // The checkout may have been initiated against a different plan than
        // the one currently on file; the entry's snapshot wins.
        if let Some(snapshot) = entry.snapshot.as_ref().or(fallback_snapshot.as_ref()) {
            sub.plan = Some(snapshot.plan);
            sub.billing_interval = snapshot.interval;
        }

        // A fresh paid period starts at confirmation time, not at the old
        // schedule.
        sub.next_billing_date = add_interval(now, sub.billing_interval);
        self.subscriptions.update(&sub).await?;

        self.grant_referral_reward(entry.church_id, &entry.currency, now)
            .await?;

        tracing::info!(
            church_id = %entry.church_id,
            entry_id = %entry.id,
            provider_reference = %provider_reference,
            "Payment settled as paid"
        );
        Ok(SettleOutcome::Applied)
    }

    /// Apply a failed charge: settle the entry and start the grace clock.
    pub async fn apply_failure(
        &self,
        entry: &LedgerEntry,
        now: OffsetDateTime,
    ) -> BillingResult<SettleOutcome> {
        let won = self
            .ledger
            .settle(entry.id, LedgerEntryStatus::Failed, None, now)
            .await?;
        if !won {
            return self
                .lost_settlement(entry.id, LedgerEntryStatus::Failed)
                .await;
        }

        if let Some(mut sub) = self.subscriptions.find_by_church(entry.church_id).await? {
            self.policy.on_payment_failure(&mut sub, now);
            self.subscriptions.update(&sub).await?;
            tracing::warn!(
                church_id = %entry.church_id,
                entry_id = %entry.id,
                grace_period_end = ?sub.grace_period_end,
                "Charge failed, subscription past due"
            );
        }
        Ok(SettleOutcome::Applied)
    }

    /// The conditional update touched no row: classify why.
    async fn lost_settlement(
        &self,
        entry_id: Uuid,
        wanted: LedgerEntryStatus,
    ) -> BillingResult<SettleOutcome> {
        let current = self.ledger.find(entry_id).await?.map(|e| e.status);
        if current == Some(wanted) {
            tracing::info!(entry_id = %entry_id, "Duplicate settlement event ignored");
            Ok(SettleOutcome::AlreadySettled)
        } else {
            tracing::warn!(
                entry_id = %entry_id,
                current_status = ?current,
                wanted = ?wanted,
                "Settlement event arrived after the entry left pending"
            );
            Ok(SettleOutcome::Superseded)
        }
    }

    /// One-shot referral reward on the referred church's first successful
    /// payment. The conditional flip is the only guard needed against
    /// concurrent duplicate deliveries.
    async fn grant_referral_reward(
        &self,
        referred_church: Uuid,
        currency: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let Some(record) = self
            .referrals
            .mark_rewarded_if_pending(referred_church, now)
            .await?
        else {
            return Ok(());
        };

        self.subscriptions
            .add_free_month(record.referrer_church)
            .await?;
        self.ledger
            .append(&LedgerEntry::free_month(
                record.referrer_church,
                currency,
                now,
            ))
            .await?;

        tracing::info!(
            referrer_church = %record.referrer_church,
            referred_church = %referred_church,
            "Referral reward credited"
        );
        Ok(())
    }
}
