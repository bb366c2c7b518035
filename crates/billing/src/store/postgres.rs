//! PostgreSQL store implementations
//!
//! Runtime-bound sqlx queries. Every transition that must not double-apply
//! (ledger settlement, free-month consumption, referral reward, the warning
//! latch) is a single `UPDATE ... WHERE <current status>` whose
//! `rows_affected` is the success signal; this works across process
//! instances where an in-memory mutex would not.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, LedgerEntryStatus, LedgerEntryType, LedgerStore, PlanSnapshot};
use crate::plan::{FeatureCategories, Plan, PlanName, PlanPrice, PlanStore};
use crate::referral::{ReferralRecord, ReferralStore, RewardStatus};
use crate::subscription::{
    BillingInterval, PaymentMethod, Subscription, SubscriptionState, SubscriptionStore,
};
use crate::webhook_log::{WebhookLog, WebhookLogStore, WebhookStatus};

const SUBSCRIPTION_COLUMNS: &str = "id, church_id, state, plan, pending_plan, trial_start, \
     trial_end, billing_interval, next_billing_date, currency, grace_period_end, \
     free_months_earned, free_months_used, expiry_warning_shown, expiry_warning_notified_at, \
     payment_methods, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    church_id: Uuid,
    state: String,
    plan: Option<String>,
    pending_plan: Option<String>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    billing_interval: String,
    next_billing_date: OffsetDateTime,
    currency: String,
    grace_period_end: Option<OffsetDateTime>,
    free_months_earned: i32,
    free_months_used: i32,
    expiry_warning_shown: bool,
    expiry_warning_notified_at: Option<OffsetDateTime>,
    payment_methods: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        let payment_methods: Vec<PaymentMethod> = serde_json::from_str(&row.payment_methods)?;
        Ok(Subscription {
            id: row.id,
            church_id: row.church_id,
            state: SubscriptionState::parse(&row.state)?,
            plan: row.plan.as_deref().map(PlanName::parse).transpose()?,
            pending_plan: row.pending_plan.as_deref().map(PlanName::parse).transpose()?,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            billing_interval: BillingInterval::parse(&row.billing_interval)?,
            next_billing_date: row.next_billing_date,
            currency: row.currency,
            grace_period_end: row.grace_period_end,
            free_months_earned: row.free_months_earned,
            free_months_used: row.free_months_used,
            expiry_warning_shown: row.expiry_warning_shown,
            expiry_warning_notified_at: row.expiry_warning_notified_at,
            payment_methods,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn create(&self, sub: &Subscription) -> BillingResult<()> {
        let payment_methods = serde_json::to_string(&sub.payment_methods)?;
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, church_id, state, plan, pending_plan, trial_start, trial_end,
                 billing_interval, next_billing_date, currency, grace_period_end,
                 free_months_earned, free_months_used, expiry_warning_shown,
                 expiry_warning_notified_at, payment_methods, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(sub.id)
        .bind(sub.church_id)
        .bind(sub.state.as_str())
        .bind(sub.plan.map(|p| p.as_str()))
        .bind(sub.pending_plan.map(|p| p.as_str()))
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.billing_interval.as_str())
        .bind(sub.next_billing_date)
        .bind(&sub.currency)
        .bind(sub.grace_period_end)
        .bind(sub.free_months_earned)
        .bind(sub.free_months_used)
        .bind(sub.expiry_warning_shown)
        .bind(sub.expiry_warning_notified_at)
        .bind(payment_methods)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_church(&self, church_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE church_id = $1"
        ))
        .bind(church_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn due_for_billing(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE next_billing_date <= $1
              AND state NOT IN ('cancelled', 'suspended')
            ORDER BY next_billing_date
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn update(&self, sub: &Subscription) -> BillingResult<()> {
        let payment_methods = serde_json::to_string(&sub.payment_methods)?;
        sqlx::query(
            r#"
            UPDATE subscriptions SET
                state = $2, plan = $3, pending_plan = $4, trial_start = $5, trial_end = $6,
                billing_interval = $7, next_billing_date = $8, currency = $9,
                grace_period_end = $10, free_months_earned = $11, free_months_used = $12,
                expiry_warning_shown = $13, expiry_warning_notified_at = $14,
                payment_methods = $15, updated_at = NOW()
            WHERE church_id = $1
            "#,
        )
        .bind(sub.church_id)
        .bind(sub.state.as_str())
        .bind(sub.plan.map(|p| p.as_str()))
        .bind(sub.pending_plan.map(|p| p.as_str()))
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.billing_interval.as_str())
        .bind(sub.next_billing_date)
        .bind(&sub.currency)
        .bind(sub.grace_period_end)
        .bind(sub.free_months_earned)
        .bind(sub.free_months_used)
        .bind(sub.expiry_warning_shown)
        .bind(sub.expiry_warning_notified_at)
        .bind(payment_methods)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_free_month(
        &self,
        church_id: Uuid,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                free_months_used = free_months_used + 1,
                next_billing_date = $2,
                state = 'active',
                grace_period_end = NULL,
                expiry_warning_shown = FALSE,
                updated_at = NOW()
            WHERE church_id = $1
              AND free_months_used < free_months_earned
            "#,
        )
        .bind(church_id)
        .bind(next_billing_date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_free_month(&self, church_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET free_months_earned = free_months_earned + 1, updated_at = NOW()
            WHERE church_id = $1
            "#,
        )
        .bind(church_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn promote_pending_plan(&self, church_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan = pending_plan, pending_plan = NULL, updated_at = NOW()
            WHERE church_id = $1 AND pending_plan IS NOT NULL
            "#,
        )
        .bind(church_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_expiry_warning_shown(
        &self,
        church_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET expiry_warning_shown = TRUE, expiry_warning_notified_at = $2, updated_at = NOW()
            WHERE church_id = $1 AND expiry_warning_shown = FALSE
            "#,
        )
        .bind(church_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expiry_warning_candidates(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE next_billing_date <= $1
              AND expiry_warning_shown = FALSE
              AND state NOT IN ('cancelled', 'suspended')
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }
}

const LEDGER_COLUMNS: &str = "id, church_id, entry_type, status, amount_cents, currency, \
     provider_reference, snapshot_plan, snapshot_interval, snapshot_amount_cents, \
     snapshot_currency, created_at, settled_at";

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    church_id: Uuid,
    entry_type: String,
    status: String,
    amount_cents: i64,
    currency: String,
    provider_reference: Option<String>,
    snapshot_plan: Option<String>,
    snapshot_interval: Option<String>,
    snapshot_amount_cents: Option<i64>,
    snapshot_currency: Option<String>,
    created_at: OffsetDateTime,
    settled_at: Option<OffsetDateTime>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = BillingError;

    fn try_from(row: LedgerRow) -> BillingResult<Self> {
        let snapshot = match (
            row.snapshot_plan,
            row.snapshot_interval,
            row.snapshot_amount_cents,
            row.snapshot_currency,
        ) {
            (Some(plan), Some(interval), Some(amount_cents), Some(currency)) => {
                Some(PlanSnapshot {
                    plan: PlanName::parse(&plan)?,
                    interval: BillingInterval::parse(&interval)?,
                    amount_cents,
                    currency,
                })
            }
            _ => None,
        };
        Ok(LedgerEntry {
            id: row.id,
            church_id: row.church_id,
            entry_type: LedgerEntryType::parse(&row.entry_type)?,
            status: LedgerEntryStatus::parse(&row.status)?,
            amount_cents: row.amount_cents,
            currency: row.currency,
            provider_reference: row.provider_reference,
            snapshot,
            created_at: row.created_at,
            settled_at: row.settled_at,
        })
    }
}

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, church_id, entry_type, status, amount_cents, currency,
                 provider_reference, snapshot_plan, snapshot_interval,
                 snapshot_amount_cents, snapshot_currency, created_at, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.church_id)
        .bind(entry.entry_type.as_str())
        .bind(entry.status.as_str())
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(entry.provider_reference.as_deref())
        .bind(entry.snapshot.as_ref().map(|s| s.plan.as_str()))
        .bind(entry.snapshot.as_ref().map(|s| s.interval.as_str()))
        .bind(entry.snapshot.as_ref().map(|s| s.amount_cents))
        .bind(entry.snapshot.as_ref().map(|s| s.currency.as_str()))
        .bind(entry.created_at)
        .bind(entry.settled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<LedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn find_by_reference(&self, reference: &str) -> BillingResult<Option<LedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {LEDGER_COLUMNS} FROM ledger_entries
            WHERE provider_reference = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn list_for_church(&self, church_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {LEDGER_COLUMNS} FROM ledger_entries
            WHERE church_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(church_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn set_provider_reference(&self, id: Uuid, reference: &str) -> BillingResult<()> {
        sqlx::query("UPDATE ledger_entries SET provider_reference = $2 WHERE id = $1")
            .bind(id)
            .bind(reference)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settle(
        &self,
        id: Uuid,
        to: LedgerEntryStatus,
        provider_reference: Option<&str>,
        settled_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET status = $2,
                provider_reference = COALESCE($3, provider_reference),
                settled_at = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(provider_reference)
        .bind(settled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

const REFERRAL_COLUMNS: &str = "id, referrer_church, referred_church, reward_status, \
     reward_consumed, referred_at, subscribed_at";

#[derive(Debug, sqlx::FromRow)]
struct ReferralRow {
    id: Uuid,
    referrer_church: Uuid,
    referred_church: Uuid,
    reward_status: String,
    reward_consumed: bool,
    referred_at: OffsetDateTime,
    subscribed_at: Option<OffsetDateTime>,
}

impl TryFrom<ReferralRow> for ReferralRecord {
    type Error = BillingError;

    fn try_from(row: ReferralRow) -> BillingResult<Self> {
        Ok(ReferralRecord {
            id: row.id,
            referrer_church: row.referrer_church,
            referred_church: row.referred_church,
            reward_status: RewardStatus::parse(&row.reward_status)?,
            reward_consumed: row.reward_consumed,
            referred_at: row.referred_at,
            subscribed_at: row.subscribed_at,
        })
    }
}

pub struct PgReferralStore {
    pool: PgPool,
}

impl PgReferralStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralStore for PgReferralStore {
    async fn link(
        &self,
        referrer_church: Uuid,
        referred_church: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ReferralRecord> {
        let row: Option<ReferralRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO referrals (id, referrer_church, referred_church, referred_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (referred_church) DO NOTHING
            RETURNING {REFERRAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(referrer_church)
        .bind(referred_church)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ReferralRecord::try_from)
            .transpose()?
            .ok_or(BillingError::ReferralExists(referred_church))
    }

    async fn find_by_referred(
        &self,
        referred_church: Uuid,
    ) -> BillingResult<Option<ReferralRecord>> {
        let row: Option<ReferralRow> = sqlx::query_as(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referred_church = $1"
        ))
        .bind(referred_church)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ReferralRecord::try_from).transpose()
    }

    async fn mark_rewarded_if_pending(
        &self,
        referred_church: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ReferralRecord>> {
        let row: Option<ReferralRow> = sqlx::query_as(&format!(
            r#"
            UPDATE referrals
            SET reward_status = 'rewarded', subscribed_at = $2
            WHERE referred_church = $1 AND reward_status = 'pending'
            RETURNING {REFERRAL_COLUMNS}
            "#
        ))
        .bind(referred_church)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ReferralRecord::try_from).transpose()
    }

    async fn mark_oldest_reward_consumed(&self, referrer_church: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE referrals SET reward_consumed = TRUE
            WHERE id = (
                SELECT id FROM referrals
                WHERE referrer_church = $1
                  AND reward_status = 'rewarded'
                  AND reward_consumed = FALSE
                ORDER BY subscribed_at ASC NULLS LAST
                LIMIT 1
            )
            "#,
        )
        .bind(referrer_church)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookLogRow {
    id: Uuid,
    event_type: Option<String>,
    reference: Option<String>,
    status: String,
    error_message: Option<String>,
    headers: String,
    payload: String,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookLogRow> for WebhookLog {
    type Error = BillingError;

    fn try_from(row: WebhookLogRow) -> BillingResult<Self> {
        Ok(WebhookLog {
            id: row.id,
            event_type: row.event_type,
            reference: row.reference,
            status: WebhookStatus::parse(&row.status)?,
            error_message: row.error_message,
            headers: row.headers,
            payload: row.payload,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

pub struct PgWebhookLogStore {
    pool: PgPool,
}

impl PgWebhookLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookLogStore for PgWebhookLogStore {
    async fn record_received(
        &self,
        event_type: Option<&str>,
        reference: Option<&str>,
        headers: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO webhook_logs (id, event_type, reference, status, headers, payload, received_at)
            VALUES ($1, $2, $3, 'received', $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(event_type)
        .bind(reference)
        .bind(headers)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_logs
            SET status = $2, error_message = $3, processed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> BillingResult<Option<WebhookLog>> {
        let row: Option<WebhookLogRow> = sqlx::query_as(
            r#"
            SELECT id, event_type, reference, status, error_message, headers, payload,
                   received_at, processed_at
            FROM webhook_logs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookLog::try_from).transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    name: String,
    members: bool,
    events: bool,
    ministries: bool,
    finance: bool,
    reports: bool,
    branches: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanPriceRow {
    currency: String,
    billing_interval: String,
    amount_cents: i64,
}

pub struct PgPlanStore {
    pool: PgPool,
}

impl PgPlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanStore for PgPlanStore {
    async fn find(&self, name: PlanName) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT name, members, events, ministries, finance, reports, branches
            FROM plans WHERE name = $1
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let price_rows: Vec<PlanPriceRow> = sqlx::query_as(
            "SELECT currency, billing_interval, amount_cents FROM plan_prices WHERE plan = $1",
        )
        .bind(name.as_str())
        .fetch_all(&self.pool)
        .await?;
        let prices = price_rows
            .into_iter()
            .map(|p| {
                Ok(PlanPrice {
                    currency: p.currency,
                    interval: BillingInterval::parse(&p.billing_interval)?,
                    amount_cents: p.amount_cents,
                })
            })
            .collect::<BillingResult<Vec<_>>>()?;

        Ok(Some(Plan {
            name: PlanName::parse(&row.name)?,
            features: FeatureCategories {
                members: row.members,
                events: row.events,
                ministries: row.ministries,
                finance: row.finance,
                reports: row.reports,
                branches: row.branches,
            },
            prices,
        }))
    }

    async fn price(
        &self,
        name: PlanName,
        currency: &str,
        interval: BillingInterval,
    ) -> BillingResult<Option<i64>> {
        let amount: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT amount_cents FROM plan_prices
            WHERE plan = $1 AND currency = $2 AND billing_interval = $3
            "#,
        )
        .bind(name.as_str())
        .bind(currency)
        .bind(interval.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(amount.map(|(a,)| a))
    }
}
