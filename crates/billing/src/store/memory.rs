//! In-memory store implementations
//!
//! Test doubles for the repository traits, mirroring the conditional-update
//! semantics of the PostgreSQL implementations: every guarded transition
//! checks the current status under a single lock, so the idempotency tests
//! exercise the same decision points production does.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, LedgerEntryStatus, LedgerStore};
use crate::plan::{Plan, PlanName, PlanStore};
use crate::provider::{ChargeOutcome, ChargeRequest, PaymentProvider};
use crate::referral::{ReferralRecord, ReferralStore, RewardStatus};
use crate::subscription::{Subscription, SubscriptionState, SubscriptionStore};
use crate::webhook_log::{WebhookLog, WebhookLogStore, WebhookStatus};

#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, sub: Subscription) {
        self.subscriptions.lock().await.insert(sub.church_id, sub);
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn create(&self, sub: &Subscription) -> BillingResult<()> {
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(&sub.church_id) {
            return Err(BillingError::SubscriptionExists(sub.church_id));
        }
        subs.insert(sub.church_id, sub.clone());
        Ok(())
    }

    async fn find_by_church(&self, church_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.lock().await.get(&church_id).cloned())
    }

    async fn due_for_billing(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let mut due: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| {
                s.next_billing_date <= now
                    && !matches!(
                        s.state,
                        SubscriptionState::Cancelled | SubscriptionState::Suspended
                    )
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_date);
        Ok(due)
    }

    async fn update(&self, sub: &Subscription) -> BillingResult<()> {
        self.subscriptions
            .lock()
            .await
            .insert(sub.church_id, sub.clone());
        Ok(())
    }

    async fn consume_free_month(
        &self,
        church_id: Uuid,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut subs = self.subscriptions.lock().await;
        let Some(sub) = subs.get_mut(&church_id) else {
            return Ok(false);
        };
        if sub.free_months_used >= sub.free_months_earned {
            return Ok(false);
        }
        sub.free_months_used += 1;
        sub.next_billing_date = next_billing_date;
        sub.state = SubscriptionState::Active;
        sub.grace_period_end = None;
        sub.expiry_warning_shown = false;
        Ok(true)
    }

    async fn add_free_month(&self, church_id: Uuid) -> BillingResult<bool> {
        let mut subs = self.subscriptions.lock().await;
        match subs.get_mut(&church_id) {
            Some(sub) => {
                sub.free_months_earned += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn promote_pending_plan(&self, church_id: Uuid) -> BillingResult<bool> {
        let mut subs = self.subscriptions.lock().await;
        let Some(sub) = subs.get_mut(&church_id) else {
            return Ok(false);
        };
        match sub.pending_plan.take() {
            Some(plan) => {
                sub.plan = Some(plan);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_expiry_warning_shown(
        &self,
        church_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut subs = self.subscriptions.lock().await;
        let Some(sub) = subs.get_mut(&church_id) else {
            return Ok(false);
        };
        if sub.expiry_warning_shown {
            return Ok(false);
        }
        sub.expiry_warning_shown = true;
        sub.expiry_warning_notified_at = Some(now);
        Ok(true)
    }

    async fn expiry_warning_candidates(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .await
            .values()
            .filter(|s| {
                s.next_billing_date <= cutoff
                    && !s.expiry_warning_shown
                    && !matches!(
                        s.state,
                        SubscriptionState::Cancelled | SubscriptionState::Suspended
                    )
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> BillingResult<()> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<LedgerEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> BillingResult<Option<LedgerEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .rev()
            .find(|e| e.provider_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn list_for_church(&self, church_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.church_id == church_id)
            .cloned()
            .collect())
    }

    async fn set_provider_reference(&self, id: Uuid, reference: &str) -> BillingResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.provider_reference = Some(reference.to_string());
        }
        Ok(())
    }

    async fn settle(
        &self,
        id: Uuid,
        to: LedgerEntryStatus,
        provider_reference: Option<&str>,
        settled_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        if entry.status != LedgerEntryStatus::Pending {
            return Ok(false);
        }
        entry.status = to;
        if let Some(reference) = provider_reference {
            entry.provider_reference = Some(reference.to_string());
        }
        entry.settled_at = Some(settled_at);
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryReferralStore {
    records: Mutex<Vec<ReferralRecord>>,
}

impl MemoryReferralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<ReferralRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ReferralStore for MemoryReferralStore {
    async fn link(
        &self,
        referrer_church: Uuid,
        referred_church: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ReferralRecord> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.referred_church == referred_church) {
            return Err(BillingError::ReferralExists(referred_church));
        }
        let record = ReferralRecord {
            id: Uuid::new_v4(),
            referrer_church,
            referred_church,
            reward_status: RewardStatus::Pending,
            reward_consumed: false,
            referred_at: now,
            subscribed_at: None,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn find_by_referred(
        &self,
        referred_church: Uuid,
    ) -> BillingResult<Option<ReferralRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|r| r.referred_church == referred_church)
            .cloned())
    }

    async fn mark_rewarded_if_pending(
        &self,
        referred_church: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ReferralRecord>> {
        let mut records = self.records.lock().await;
        let Some(record) = records.iter_mut().find(|r| {
            r.referred_church == referred_church && r.reward_status == RewardStatus::Pending
        }) else {
            return Ok(None);
        };
        record.reward_status = RewardStatus::Rewarded;
        record.subscribed_at = Some(now);
        Ok(Some(record.clone()))
    }

    async fn mark_oldest_reward_consumed(&self, referrer_church: Uuid) -> BillingResult<bool> {
        let mut records = self.records.lock().await;
        let oldest = records
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.referrer_church == referrer_church
                    && r.reward_status == RewardStatus::Rewarded
                    && !r.reward_consumed
            })
            .min_by_key(|(_, r)| r.subscribed_at)
            .map(|(i, _)| i);
        match oldest {
            Some(i) => {
                records[i].reward_consumed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct MemoryWebhookLogStore {
    logs: Mutex<Vec<WebhookLog>>,
}

impl MemoryWebhookLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<WebhookLog> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl WebhookLogStore for MemoryWebhookLogStore {
    async fn record_received(
        &self,
        event_type: Option<&str>,
        reference: Option<&str>,
        headers: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        self.logs.lock().await.push(WebhookLog {
            id,
            event_type: event_type.map(str::to_string),
            reference: reference.map(str::to_string),
            status: WebhookStatus::Received,
            error_message: None,
            headers: headers.to_string(),
            payload: payload.to_string(),
            received_at: now,
            processed_at: None,
        });
        Ok(id)
    }

    async fn mark(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut logs = self.logs.lock().await;
        if let Some(log) = logs.iter_mut().find(|l| l.id == id) {
            log.status = status;
            log.error_message = error_message.map(str::to_string);
            log.processed_at = Some(now);
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<WebhookLog>> {
        Ok(self.logs.lock().await.iter().find(|l| l.id == id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryPlanStore {
    plans: Mutex<HashMap<PlanName, Plan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: Vec<Plan>) -> Self {
        let map = plans.into_iter().map(|p| (p.name, p)).collect();
        Self {
            plans: Mutex::new(map),
        }
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn find(&self, name: PlanName) -> BillingResult<Option<Plan>> {
        Ok(self.plans.lock().await.get(&name).cloned())
    }

    async fn price(
        &self,
        name: PlanName,
        currency: &str,
        interval: crate::subscription::BillingInterval,
    ) -> BillingResult<Option<i64>> {
        Ok(self
            .plans
            .lock()
            .await
            .get(&name)
            .and_then(|p| p.price(currency, interval)))
    }
}

/// Scriptable provider double. Outcomes are consumed in order; once the
/// script is exhausted every charge is accepted with a generated reference.
#[derive(Default)]
pub struct MockPaymentProvider {
    script: Mutex<Vec<ChargeOutcome>>,
    calls: Mutex<Vec<ChargeRequest>>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: Vec<ChargeOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub async fn calls(&self) -> Vec<ChargeRequest> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn charge(&self, request: &ChargeRequest) -> BillingResult<ChargeOutcome> {
        self.calls.lock().await.push(request.clone());
        let mut script = self.script.lock().await;
        if script.is_empty() {
            Ok(ChargeOutcome::Accepted {
                reference: format!("mock_{}", request.ledger_entry_id),
            })
        } else {
            Ok(script.remove(0))
        }
    }
}
