// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Exercises the boundary conditions and race conditions the engine must
//! hold under:
//! - Idempotent settlement under duplicate delivery
//! - Referral reward exclusivity
//! - Free-month conservation across cycle runs
//! - Out-of-order success/failure settlement
//! - Same-day batch rerun idempotency
//! - Pending-plan promotion on the billing boundary
//! - Webhook log lifecycle and operator replay

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha512;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::{BillingConfig, ProviderConfig};
use crate::cycle::BillingCycleProcessor;
use crate::dates::add_interval;
use crate::ledger::{LedgerEntry, LedgerEntryStatus, LedgerEntryType, LedgerStore, PlanSnapshot};
use crate::plan::PlanName;
use crate::policy::GracePolicy;
use crate::provider::ChargeOutcome;
use crate::referral::{ReferralStore, RewardStatus};
use crate::settlement::{SettleOutcome, Settlement};
use crate::store::memory::{
    MemoryLedgerStore, MemoryPlanStore, MemoryReferralStore, MemorySubscriptionStore,
    MemoryWebhookLogStore, MockPaymentProvider,
};
use crate::subscription::{BillingInterval, Subscription, SubscriptionState, SubscriptionStore};
use crate::subscriptions::SubscriptionsService;
use crate::testing::{catalog, sample_subscription};
use crate::webhook_log::WebhookStatus;
use crate::webhooks::{WebhookDisposition, WebhookProcessor};

const SECRET: &str = "whsec_test123secret456";

struct Harness {
    subs: Arc<MemorySubscriptionStore>,
    ledger: Arc<MemoryLedgerStore>,
    referrals: Arc<MemoryReferralStore>,
    logs: Arc<MemoryWebhookLogStore>,
    provider: Arc<MockPaymentProvider>,
    settlement: Settlement,
    cycle: BillingCycleProcessor,
    webhooks: WebhookProcessor,
    service: SubscriptionsService,
}

fn harness_with_provider(script: Vec<ChargeOutcome>) -> Harness {
    let subs = Arc::new(MemorySubscriptionStore::new());
    let ledger = Arc::new(MemoryLedgerStore::new());
    let referrals = Arc::new(MemoryReferralStore::new());
    let logs = Arc::new(MemoryWebhookLogStore::new());
    let plans = Arc::new(MemoryPlanStore::with_plans(catalog()));
    let provider = MockPaymentProvider::scripted(script);

    let settlement = Settlement::new(
        subs.clone(),
        ledger.clone(),
        referrals.clone(),
        GracePolicy::new(7),
    );
    let cycle = BillingCycleProcessor::new(
        subs.clone(),
        ledger.clone(),
        referrals.clone(),
        plans.clone(),
        provider.clone(),
        settlement.clone(),
    );
    let webhooks = WebhookProcessor::new(
        logs.clone(),
        ledger.clone(),
        settlement.clone(),
        SECRET.to_string(),
    );
    let config = BillingConfig {
        webhook_secret: SECRET.to_string(),
        trial_days: 14,
        grace_period_days: 7,
        expiry_warning_days: 7,
        provider: ProviderConfig {
            base_url: "http://localhost:9".to_string(),
            secret_key: "sk_test".to_string(),
        },
    };
    let service = SubscriptionsService::new(
        subs.clone(),
        ledger.clone(),
        plans,
        referrals.clone(),
        provider.clone(),
        settlement.clone(),
        config,
    );

    Harness {
        subs,
        ledger,
        referrals,
        logs,
        provider,
        settlement,
        cycle,
        webhooks,
        service,
    }
}

fn harness() -> Harness {
    harness_with_provider(Vec::new())
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn success_event(reference: &str, entry_id: Uuid) -> String {
    format!(
        r#"{{"event":"charge.success","data":{{"reference":"{reference}","metadata":{{"ledger_entry_id":"{entry_id}"}}}}}}"#
    )
}

fn failure_event(reference: &str, entry_id: Uuid) -> String {
    format!(
        r#"{{"event":"charge.failed","data":{{"reference":"{reference}","metadata":{{"ledger_entry_id":"{entry_id}"}}}}}}"#
    )
}

async fn pending_entry(h: &Harness, sub: &Subscription) -> LedgerEntry {
    let entry = LedgerEntry::pending_payment(
        sub.church_id,
        PlanSnapshot {
            plan: PlanName::Standard,
            interval: BillingInterval::Monthly,
            amount_cents: 5000,
            currency: "GHS".to_string(),
        },
        OffsetDateTime::now_utc(),
    );
    h.ledger.append(&entry).await.unwrap();
    entry
}

mod settlement_idempotency {
    use super::*;

    // =========================================================================
    // Applying the same success event twice mutates nothing the second time
    // =========================================================================
    #[tokio::test]
    async fn duplicate_success_is_a_no_op() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry = pending_entry(&h, &sub).await;
        let now = OffsetDateTime::now_utc();

        let first = h
            .settlement
            .apply_success(&entry, "ref_1", None, now)
            .await
            .unwrap();
        assert_eq!(first, SettleOutcome::Applied);

        let after_first = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();

        let second = h
            .settlement
            .apply_success(&entry, "ref_1", None, now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(second, SettleOutcome::AlreadySettled);

        let after_second = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(
            after_first.next_billing_date,
            after_second.next_billing_date
        );
        let settled = h.ledger.find(entry.id).await.unwrap().unwrap();
        assert_eq!(settled.status, LedgerEntryStatus::Paid);
        assert_eq!(settled.provider_reference.as_deref(), Some("ref_1"));
    }

    #[tokio::test]
    async fn duplicate_webhook_delivery_settles_once() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry = pending_entry(&h, &sub).await;

        let body = success_event("ref_dup", entry.id);
        let signature = sign(body.as_bytes());

        for _ in 0..2 {
            let disposition = h
                .webhooks
                .process(body.as_bytes(), Some(&signature), "{}")
                .await
                .unwrap();
            assert_eq!(disposition, WebhookDisposition::Acknowledged);
        }

        let settled = h.ledger.find(entry.id).await.unwrap().unwrap();
        assert_eq!(settled.status, LedgerEntryStatus::Paid);
        // Both deliveries were logged, both ended processed.
        let logs = h.logs.all().await;
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == WebhookStatus::Processed));
    }

    // =========================================================================
    // Failure then late success: the status guard drops the late event
    // =========================================================================
    #[tokio::test]
    async fn late_success_after_failure_is_superseded() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry = pending_entry(&h, &sub).await;
        let now = OffsetDateTime::now_utc();

        assert_eq!(
            h.settlement.apply_failure(&entry, now).await.unwrap(),
            SettleOutcome::Applied
        );
        let past_due = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(past_due.state, SubscriptionState::PastDue);
        assert!(past_due.grace_period_end.is_some());

        assert_eq!(
            h.settlement
                .apply_success(&entry, "ref_late", None, now)
                .await
                .unwrap(),
            SettleOutcome::Superseded
        );
        let unchanged = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, SubscriptionState::PastDue);
        let settled = h.ledger.find(entry.id).await.unwrap().unwrap();
        assert_eq!(settled.status, LedgerEntryStatus::Failed);
    }

    #[tokio::test]
    async fn late_failure_after_success_is_superseded() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry = pending_entry(&h, &sub).await;
        let now = OffsetDateTime::now_utc();

        h.settlement
            .apply_success(&entry, "ref_1", None, now)
            .await
            .unwrap();
        assert_eq!(
            h.settlement.apply_failure(&entry, now).await.unwrap(),
            SettleOutcome::Superseded
        );
        let sub = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
        assert!(sub.grace_period_end.is_none());
    }
}

mod referral_rewards {
    use super::*;

    // =========================================================================
    // The pending -> rewarded flip happens at most once per referred church
    // =========================================================================
    #[tokio::test]
    async fn reward_is_granted_exactly_once() {
        let h = harness();
        let referrer = sample_subscription();
        let mut referred = sample_subscription();
        referred.church_id = Uuid::new_v4();
        h.subs.insert(referrer.clone()).await;
        h.subs.insert(referred.clone()).await;
        h.referrals
            .link(
                referrer.church_id,
                referred.church_id,
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        // Two separate charges settle for the referred church.
        let now = OffsetDateTime::now_utc();
        for reference in ["ref_a", "ref_b"] {
            let entry = pending_entry(&h, &referred).await;
            h.settlement
                .apply_success(&entry, reference, None, now)
                .await
                .unwrap();
        }

        let record = h
            .referrals
            .find_by_referred(referred.church_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.reward_status, RewardStatus::Rewarded);

        let credited = h
            .subs
            .find_by_church(referrer.church_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credited.free_months_earned, 1);

        let referrer_entries = h.ledger.list_for_church(referrer.church_id).await.unwrap();
        let grants = referrer_entries
            .iter()
            .filter(|e| e.entry_type == LedgerEntryType::FreeMonth)
            .count();
        assert_eq!(grants, 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_do_not_double_credit() {
        let h = harness();
        let referrer = sample_subscription();
        let mut referred = sample_subscription();
        referred.church_id = Uuid::new_v4();
        h.subs.insert(referrer.clone()).await;
        h.subs.insert(referred.clone()).await;
        h.referrals
            .link(
                referrer.church_id,
                referred.church_id,
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let entry = pending_entry(&h, &referred).await;
        let body = success_event("ref_conc", entry.id);
        let signature = sign(body.as_bytes());

        let (a, b) = tokio::join!(
            h.webhooks.process(body.as_bytes(), Some(&signature), "{}"),
            h.webhooks.process(body.as_bytes(), Some(&signature), "{}"),
        );
        assert_eq!(a.unwrap(), WebhookDisposition::Acknowledged);
        assert_eq!(b.unwrap(), WebhookDisposition::Acknowledged);

        let credited = h
            .subs
            .find_by_church(referrer.church_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credited.free_months_earned, 1);
    }

    #[tokio::test]
    async fn payment_without_referral_grants_nothing() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry = pending_entry(&h, &sub).await;

        h.settlement
            .apply_success(&entry, "ref_1", None, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(h.referrals.all().await.is_empty());
    }
}

mod billing_cycle {
    use super::*;

    // =========================================================================
    // Free-month path: consume balance, never touch the catalog or provider
    // =========================================================================
    #[tokio::test]
    async fn free_month_satisfies_the_cycle_without_a_charge() {
        let h = harness();
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.free_months_earned = 2;
        sub.next_billing_date = now;
        sub.expiry_warning_shown = true;
        h.subs.insert(sub.clone()).await;

        let summary = h.cycle.run_at(now).await;
        assert_eq!(summary.free_months, 1);
        assert_eq!(summary.charged, 0);
        assert_eq!(summary.errors, 0);

        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.free_months_used, 1);
        assert!(updated.free_months_used <= updated.free_months_earned);
        assert_eq!(updated.state, SubscriptionState::Active);
        assert!(!updated.expiry_warning_shown);
        // Anchored to the previous schedule, not to the run time.
        assert_eq!(
            updated.next_billing_date,
            add_interval(now, BillingInterval::Monthly)
        );

        let entries = h.ledger.list_for_church(sub.church_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, LedgerEntryType::FreeMonth);
        assert_eq!(entries[0].amount_cents, 0);
        assert!(h.provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn free_month_conservation_holds_across_runs() {
        let h = harness();
        let mut now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.free_months_earned = 2;
        sub.next_billing_date = now;
        h.subs.insert(sub.clone()).await;

        for _ in 0..4 {
            h.cycle.run_at(now).await;
            let state = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
            assert!(state.free_months_used <= state.free_months_earned);
            now = state.next_billing_date;
        }

        let final_state = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(final_state.free_months_used, 2);
        // Once the balance is spent, the cycle charges.
        let payments = h
            .ledger
            .list_for_church(sub.church_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.entry_type == LedgerEntryType::Payment)
            .count();
        assert!(payments >= 1);
    }

    // =========================================================================
    // Paid path: pending entry with snapshot, schedule advanced off the old
    // date, rerun is a no-op
    // =========================================================================
    #[tokio::test]
    async fn charge_writes_a_pending_snapshot_entry() {
        let h = harness();
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.next_billing_date = now;
        h.subs.insert(sub.clone()).await;

        let summary = h.cycle.run_at(now).await;
        assert_eq!(summary.charged, 1);

        let entries = h.ledger.list_for_church(sub.church_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.entry_type, LedgerEntryType::Payment);
        assert_eq!(entry.status, LedgerEntryStatus::Pending);
        assert_eq!(entry.amount_cents, 5000);
        let snapshot = entry.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.plan, PlanName::Standard);
        assert_eq!(snapshot.interval, BillingInterval::Monthly);
        assert!(entry.provider_reference.is_some());

        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.next_billing_date, datetime!(2024-07-01 00:00 UTC));

        // Same-day rerun: the advanced date no longer matches.
        let rerun = h.cycle.run_at(now).await;
        assert_eq!(rerun.scanned, 0);
        assert_eq!(h.ledger.list_for_church(sub.church_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_price_skips_without_charging() {
        let h = harness();
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.currency = "USD".to_string();
        sub.next_billing_date = now;
        h.subs.insert(sub.clone()).await;

        let summary = h.cycle.run_at(now).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 0);
        assert!(h.ledger.list_for_church(sub.church_id).await.unwrap().is_empty());

        // The schedule is untouched; the next run retries.
        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.next_billing_date, now);
    }

    #[tokio::test]
    async fn one_bad_subscription_does_not_abort_the_batch() {
        let h = harness();
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut priced_out = sample_subscription();
        priced_out.currency = "USD".to_string();
        priced_out.next_billing_date = now;
        let mut fine = sample_subscription();
        fine.church_id = Uuid::new_v4();
        fine.next_billing_date = now;
        h.subs.insert(priced_out).await;
        h.subs.insert(fine.clone()).await;

        let summary = h.cycle.run_at(now).await;
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.charged, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(h.ledger.list_for_church(fine.church_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_plan_takes_effect_on_the_billing_boundary() {
        let h = harness();
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.pending_plan = Some(PlanName::Premium);
        sub.next_billing_date = now;
        h.subs.insert(sub.clone()).await;

        h.cycle.run_at(now).await;

        // This cycle still billed the old plan; the new one is now on file.
        let entries = h.ledger.list_for_church(sub.church_id).await.unwrap();
        assert_eq!(entries[0].snapshot.as_ref().unwrap().plan, PlanName::Standard);
        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.plan, Some(PlanName::Premium));
        assert_eq!(updated.pending_plan, None);
    }

    #[tokio::test]
    async fn cancelled_and_suspended_are_never_scanned() {
        let h = harness();
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut cancelled = sample_subscription();
        cancelled.state = SubscriptionState::Cancelled;
        cancelled.next_billing_date = now;
        let mut suspended = sample_subscription();
        suspended.church_id = Uuid::new_v4();
        suspended.state = SubscriptionState::Suspended;
        suspended.next_billing_date = now;
        h.subs.insert(cancelled).await;
        h.subs.insert(suspended).await;

        let summary = h.cycle.run_at(now).await;
        assert_eq!(summary.scanned, 0);
    }

    // =========================================================================
    // Synchronous settlement: providers without webhooks take the same
    // transitions inline
    // =========================================================================
    #[tokio::test]
    async fn synchronous_failure_routes_through_grace_policy() {
        let h = harness_with_provider(vec![ChargeOutcome::Settled {
            reference: "sync_fail".to_string(),
            success: false,
        }]);
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.next_billing_date = now;
        h.subs.insert(sub.clone()).await;

        h.cycle.run_at(now).await;

        let entries = h.ledger.list_for_church(sub.church_id).await.unwrap();
        assert_eq!(entries[0].status, LedgerEntryStatus::Failed);
        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.state, SubscriptionState::PastDue);
        assert_eq!(
            updated.grace_period_end,
            Some(now + Duration::days(7))
        );
    }

    #[tokio::test]
    async fn synchronous_success_activates_immediately() {
        let h = harness_with_provider(vec![ChargeOutcome::Settled {
            reference: "sync_ok".to_string(),
            success: true,
        }]);
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        sub.next_billing_date = now;
        h.subs.insert(sub.clone()).await;

        h.cycle.run_at(now).await;

        let entries = h.ledger.list_for_church(sub.church_id).await.unwrap();
        assert_eq!(entries[0].status, LedgerEntryStatus::Paid);
        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.state, SubscriptionState::Active);
        // Success re-anchors the schedule to settlement time.
        assert_eq!(
            updated.next_billing_date,
            add_interval(now, BillingInterval::Monthly)
        );
    }
}

mod trial_conversion {
    use super::*;

    // =========================================================================
    // Trial to paid: checkout entry settles, trial fields clear, plan and
    // schedule come from the snapshot
    // =========================================================================
    #[tokio::test]
    async fn successful_webhook_converts_the_trial() {
        let h = harness();
        let church_id = Uuid::new_v4();
        h.service
            .create_trial(church_id, "GHS", BillingInterval::Monthly)
            .await
            .unwrap();

        let entry = h
            .service
            .initiate_checkout(church_id, PlanName::Standard, BillingInterval::Monthly)
            .await
            .unwrap();
        assert_eq!(entry.amount_cents, 5000);
        assert_eq!(entry.status, LedgerEntryStatus::Pending);

        let body = success_event("trial_ref", entry.id);
        let signature = sign(body.as_bytes());
        let before = OffsetDateTime::now_utc();
        h.webhooks
            .process(body.as_bytes(), Some(&signature), "{}")
            .await
            .unwrap();

        let sub = h.subs.find_by_church(church_id).await.unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.plan, Some(PlanName::Standard));
        assert!(sub.trial_start.is_none());
        assert!(sub.trial_end.is_none());
        let days_out = (sub.next_billing_date - before).whole_days();
        assert!((27..=31).contains(&days_out), "got {days_out} days");
    }

    #[tokio::test]
    async fn trial_subscription_starts_with_full_schedule() {
        let h = harness();
        let church_id = Uuid::new_v4();
        let sub = h
            .service
            .create_trial(church_id, "GHS", BillingInterval::Monthly)
            .await
            .unwrap();

        assert_eq!(sub.state, SubscriptionState::Trialing);
        assert!(sub.plan.is_none());
        assert_eq!(sub.next_billing_date, sub.trial_end.unwrap());
        let trial_len = (sub.trial_end.unwrap() - sub.trial_start.unwrap()).whole_days();
        assert_eq!(trial_len, 14);

        // One subscription per church.
        let duplicate = h
            .service
            .create_trial(church_id, "GHS", BillingInterval::Monthly)
            .await;
        assert!(duplicate.is_err());
    }
}

mod grace_recovery {
    use super::*;

    // =========================================================================
    // Failed charge then recovery before the grace window lapses
    // =========================================================================
    #[tokio::test]
    async fn failure_then_fresh_charge_recovers_the_subscription() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let now = OffsetDateTime::now_utc();

        let failed = pending_entry(&h, &sub).await;
        h.settlement.apply_failure(&failed, now).await.unwrap();
        assert_eq!(
            h.subs
                .find_by_church(sub.church_id)
                .await
                .unwrap()
                .unwrap()
                .state,
            SubscriptionState::PastDue
        );

        // A retry entry settles successfully inside the grace window.
        let retry = pending_entry(&h, &sub).await;
        let body = success_event("retry_ref", retry.id);
        let signature = sign(body.as_bytes());
        h.webhooks
            .process(body.as_bytes(), Some(&signature), "{}")
            .await
            .unwrap();

        let recovered = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(recovered.state, SubscriptionState::Active);
        assert!(recovered.grace_period_end.is_none());
    }

    #[tokio::test]
    async fn failure_webhook_starts_the_grace_clock() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry = pending_entry(&h, &sub).await;

        let body = failure_event("fail_ref", entry.id);
        let signature = sign(body.as_bytes());
        let before = OffsetDateTime::now_utc();
        h.webhooks
            .process(body.as_bytes(), Some(&signature), "{}")
            .await
            .unwrap();

        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.state, SubscriptionState::PastDue);
        let end = updated.grace_period_end.unwrap();
        assert!(end >= before + Duration::days(7));
        assert!(end <= OffsetDateTime::now_utc() + Duration::days(7));
        assert_eq!(
            h.ledger.find(entry.id).await.unwrap().unwrap().status,
            LedgerEntryStatus::Failed
        );
    }
}

mod webhook_log_lifecycle {
    use super::*;

    #[tokio::test]
    async fn bad_signature_is_logged_then_rejected() {
        let h = harness();
        let body = br#"{"event":"charge.success","data":{"reference":"ref_x"}}"#;

        let disposition = h
            .webhooks
            .process(body, Some("deadbeef"), "{}")
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Rejected);

        let logs = h.logs.all().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, WebhookStatus::Rejected);
        assert_eq!(logs[0].error_message.as_deref(), Some("signature mismatch"));
        // The raw body is preserved for audit even on rejection.
        assert!(logs[0].payload.contains("ref_x"));
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let h = harness();
        let body = br#"{"event":"charge.success","data":{"reference":"ref_x"}}"#;
        let disposition = h.webhooks.process(body, None, "{}").await.unwrap();
        assert_eq!(disposition, WebhookDisposition::Rejected);
    }

    #[tokio::test]
    async fn unknown_correlation_is_acknowledged_as_a_no_op() {
        let h = harness();
        let body = success_event("nobody_knows_this_ref", Uuid::new_v4());
        let signature = sign(body.as_bytes());

        let disposition = h
            .webhooks
            .process(body.as_bytes(), Some(&signature), "{}")
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Acknowledged);
        assert_eq!(h.logs.all().await[0].status, WebhookStatus::Processed);
    }

    #[tokio::test]
    async fn malformed_payload_is_logged_failed_but_acknowledged() {
        let h = harness();
        let body = br#"{"event": "charge.success", "data": 42}"#;
        let signature = sign(body);

        let disposition = h
            .webhooks
            .process(body, Some(&signature), "{}")
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Acknowledged);

        let logs = h.logs.all().await;
        assert_eq!(logs[0].status, WebhookStatus::Failed);
        assert!(logs[0].error_message.is_some());
    }

    #[tokio::test]
    async fn unhandled_event_types_are_acknowledged() {
        let h = harness();
        let body = br#"{"event":"transfer.success","data":{"reference":"tr_1"}}"#;
        let signature = sign(body);

        let disposition = h
            .webhooks
            .process(body, Some(&signature), "{}")
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Acknowledged);
        assert_eq!(h.logs.all().await[0].status, WebhookStatus::Processed);
    }

    // =========================================================================
    // Operator replay: an event that no-opped on first delivery applies
    // once the missing entry exists
    // =========================================================================
    #[tokio::test]
    async fn replay_recovers_an_event_that_arrived_early() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;
        let entry_id = Uuid::new_v4();

        let body = success_event("early_ref", entry_id);
        let signature = sign(body.as_bytes());
        h.webhooks
            .process(body.as_bytes(), Some(&signature), "{}")
            .await
            .unwrap();
        // No-op: the entry did not exist yet.
        assert!(h.ledger.find(entry_id).await.unwrap().is_none());

        // The checkout entry lands afterwards (e.g. a delayed write).
        let mut entry = LedgerEntry::pending_payment(
            sub.church_id,
            PlanSnapshot {
                plan: PlanName::Standard,
                interval: BillingInterval::Monthly,
                amount_cents: 5000,
                currency: "GHS".to_string(),
            },
            OffsetDateTime::now_utc(),
        );
        entry.id = entry_id;
        h.ledger.append(&entry).await.unwrap();

        let log_id = h.logs.all().await[0].id;
        let result = h.webhooks.replay(log_id).await.unwrap();
        assert_eq!(result.status, WebhookStatus::Processed);

        let settled = h.ledger.find(entry_id).await.unwrap().unwrap();
        assert_eq!(settled.status, LedgerEntryStatus::Paid);
        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.state, SubscriptionState::Active);
    }

    #[tokio::test]
    async fn replay_of_unknown_log_errors() {
        let h = harness();
        assert!(h.webhooks.replay(Uuid::new_v4()).await.is_err());
    }
}

mod subscription_management {
    use super::*;

    #[tokio::test]
    async fn plan_change_is_deferred_outside_trial() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;

        let updated = h
            .service
            .schedule_plan_change(sub.church_id, PlanName::Basic)
            .await
            .unwrap();
        assert_eq!(updated.plan, Some(PlanName::Standard));
        assert_eq!(updated.pending_plan, Some(PlanName::Basic));
    }

    #[tokio::test]
    async fn plan_change_applies_immediately_during_trial() {
        let h = harness();
        let church_id = Uuid::new_v4();
        h.service
            .create_trial(church_id, "GHS", BillingInterval::Monthly)
            .await
            .unwrap();

        let updated = h
            .service
            .schedule_plan_change(church_id, PlanName::Premium)
            .await
            .unwrap();
        assert_eq!(updated.plan, Some(PlanName::Premium));
        assert_eq!(updated.pending_plan, None);
    }

    #[tokio::test]
    async fn cancelled_subscription_clears_grace() {
        let h = harness();
        let mut sub = sample_subscription();
        sub.state = SubscriptionState::PastDue;
        sub.grace_period_end = Some(OffsetDateTime::now_utc());
        h.subs.insert(sub.clone()).await;

        let cancelled = h.service.cancel(sub.church_id).await.unwrap();
        assert_eq!(cancelled.state, SubscriptionState::Cancelled);
        assert!(cancelled.grace_period_end.is_none());
    }

    #[tokio::test]
    async fn payment_methods_deduplicate_by_fingerprint() {
        let h = harness();
        let sub = sample_subscription();
        h.subs.insert(sub.clone()).await;

        let card = crate::subscription::PaymentMethod::Card {
            brand: "visa".to_string(),
            last4: "4242".to_string(),
            exp_month: 9,
            exp_year: 2027,
        };
        assert!(h
            .service
            .add_payment_method(sub.church_id, card.clone())
            .await
            .unwrap());
        assert!(!h
            .service
            .add_payment_method(sub.church_id, card)
            .await
            .unwrap());

        let updated = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert_eq!(updated.payment_methods.len(), 1);
    }

    #[tokio::test]
    async fn expiry_warning_latch_fires_once() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        let mut sub = sample_subscription();
        sub.next_billing_date = now + Duration::days(3);
        h.subs.insert(sub.clone()).await;

        assert_eq!(h.service.sweep_expiry_warnings(now).await.unwrap(), 1);
        assert_eq!(h.service.sweep_expiry_warnings(now).await.unwrap(), 0);

        let flagged = h.subs.find_by_church(sub.church_id).await.unwrap().unwrap();
        assert!(flagged.expiry_warning_shown);
        assert!(flagged.expiry_warning_notified_at.is_some());
    }

    #[tokio::test]
    async fn referral_link_is_unique_per_referred_church() {
        let h = harness();
        let referrer = Uuid::new_v4();
        let referred = Uuid::new_v4();
        h.service.link_referral(referrer, referred).await.unwrap();
        assert!(h.service.link_referral(referrer, referred).await.is_err());
    }
}
