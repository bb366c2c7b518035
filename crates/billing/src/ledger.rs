//! Financial ledger
//!
//! Append-mostly record of financial events: payment attempts, invoices,
//! and free-month grants. Entries are immutable once settled; the only
//! permitted mutation is the single `pending -> paid|failed` transition,
//! expressed as a status-guarded conditional update.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plan::PlanName;
use crate::subscription::BillingInterval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Payment,
    Invoice,
    FreeMonth,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Payment => "payment",
            LedgerEntryType::Invoice => "invoice",
            LedgerEntryType::FreeMonth => "free_month",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "payment" => Ok(LedgerEntryType::Payment),
            "invoice" => Ok(LedgerEntryType::Invoice),
            "free_month" => Ok(LedgerEntryType::FreeMonth),
            _ => Err(BillingError::InvalidField {
                field: "entry_type",
                value: raw.to_string(),
            }),
        }
    }

    /// Statuses a ledger entry of this type may carry.
    pub fn allows(&self, status: LedgerEntryStatus) -> bool {
        use LedgerEntryStatus::*;
        match self {
            LedgerEntryType::Payment => matches!(status, Pending | Paid | Failed),
            LedgerEntryType::Invoice => matches!(status, Pending | Paid | Unpaid),
            LedgerEntryType::FreeMonth => matches!(status, Rewarded),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryStatus {
    Pending,
    Paid,
    Failed,
    Unpaid,
    Rewarded,
}

impl LedgerEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryStatus::Pending => "pending",
            LedgerEntryStatus::Paid => "paid",
            LedgerEntryStatus::Failed => "failed",
            LedgerEntryStatus::Unpaid => "unpaid",
            LedgerEntryStatus::Rewarded => "rewarded",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "pending" => Ok(LedgerEntryStatus::Pending),
            "paid" => Ok(LedgerEntryStatus::Paid),
            "failed" => Ok(LedgerEntryStatus::Failed),
            "unpaid" => Ok(LedgerEntryStatus::Unpaid),
            "rewarded" => Ok(LedgerEntryStatus::Rewarded),
            _ => Err(BillingError::InvalidField {
                field: "status",
                value: raw.to_string(),
            }),
        }
    }
}

/// Immutable copy of the plan terms at entry creation time. Later catalog
/// edits never change what a historical invoice says was billed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: PlanName,
    pub interval: BillingInterval,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub church_id: Uuid,
    pub entry_type: LedgerEntryType,
    pub status: LedgerEntryStatus,
    pub amount_cents: i64,
    pub currency: String,
    /// External charge id, null until the provider confirms.
    pub provider_reference: Option<String>,
    pub snapshot: Option<PlanSnapshot>,
    pub created_at: OffsetDateTime,
    pub settled_at: Option<OffsetDateTime>,
}

impl LedgerEntry {
    /// A charge attempt awaiting settlement.
    pub fn pending_payment(
        church_id: Uuid,
        snapshot: PlanSnapshot,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            church_id,
            entry_type: LedgerEntryType::Payment,
            status: LedgerEntryStatus::Pending,
            amount_cents: snapshot.amount_cents,
            currency: snapshot.currency.clone(),
            provider_reference: None,
            snapshot: Some(snapshot),
            created_at: now,
            settled_at: None,
        }
    }

    /// A zero-amount grant: a billing cycle satisfied without a charge, or
    /// the referrer-side credit written when a reward is granted.
    pub fn free_month(church_id: Uuid, currency: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            church_id,
            entry_type: LedgerEntryType::FreeMonth,
            status: LedgerEntryStatus::Rewarded,
            amount_cents: 0,
            currency: currency.to_string(),
            provider_reference: None,
            snapshot: None,
            created_at: now,
            settled_at: Some(now),
        }
    }
}

/// A renderable invoice built from an entry's immutable snapshot. Handed
/// to the stateless renderer collaborator; nothing flows back.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDocument {
    pub entry_id: Uuid,
    pub church_id: Uuid,
    pub entry_type: LedgerEntryType,
    pub status: LedgerEntryStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub plan: Option<PlanName>,
    pub interval: Option<BillingInterval>,
    pub provider_reference: Option<String>,
    pub issued_at: OffsetDateTime,
}

impl InvoiceDocument {
    pub fn from_entry(entry: &LedgerEntry) -> Self {
        Self {
            entry_id: entry.id,
            church_id: entry.church_id,
            entry_type: entry.entry_type,
            status: entry.status,
            amount_cents: entry.amount_cents,
            currency: entry.currency.clone(),
            plan: entry.snapshot.as_ref().map(|s| s.plan),
            interval: entry.snapshot.as_ref().map(|s| s.interval),
            provider_reference: entry.provider_reference.clone(),
            issued_at: entry.created_at,
        }
    }
}

/// Stateless document renderer: `render(document) -> bytes`.
pub trait InvoiceRenderer: Send + Sync {
    fn render(&self, document: &InvoiceDocument) -> BillingResult<Vec<u8>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> BillingResult<()>;

    async fn find(&self, id: Uuid) -> BillingResult<Option<LedgerEntry>>;

    /// Most recent entry carrying this provider reference. Fallback lookup
    /// for providers that omit correlation metadata.
    async fn find_by_reference(&self, reference: &str) -> BillingResult<Option<LedgerEntry>>;

    async fn list_for_church(&self, church_id: Uuid) -> BillingResult<Vec<LedgerEntry>>;

    async fn set_provider_reference(&self, id: Uuid, reference: &str) -> BillingResult<()>;

    /// The single permitted settlement transition, guarded by the current
    /// status: `UPDATE ... WHERE id = $id AND status = 'pending'`. Returns
    /// whether this caller won the transition.
    async fn settle(
        &self,
        id: Uuid,
        to: LedgerEntryStatus,
        provider_reference: Option<&str>,
        settled_at: OffsetDateTime,
    ) -> BillingResult<bool>;
}
