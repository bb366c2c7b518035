//! Billing Invariants Module
//!
//! Runnable consistency checks for the billing engine, intended to be run
//! after webhook replays and on a daily schedule. Checks only read, never
//! write, and each violation carries enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Church(es) affected
    pub church_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Severity level
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money may be moving incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ChurchCountRow {
    church_id: Uuid,
    row_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct GraceRow {
    church_id: Uuid,
    state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct FreeMonthRow {
    church_id: Uuid,
    free_months_earned: i32,
    free_months_used: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct UnreferencedSettledRow {
    id: Uuid,
    church_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct BadStatusRow {
    id: Uuid,
    church_id: Uuid,
    entry_type: String,
    status: String,
}

/// Service for running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_one_subscription_per_church().await?);
        violations.extend(self.check_free_month_conservation().await?);
        violations.extend(self.check_grace_only_while_past_due().await?);
        violations.extend(self.check_paid_entries_have_reference().await?);
        violations.extend(self.check_status_domain_by_type().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Exactly one subscription per church
    ///
    /// More than one would double-bill and make the feature gate ambiguous.
    async fn check_one_subscription_per_church(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ChurchCountRow> = sqlx::query_as(
            r#"
            SELECT church_id, COUNT(*) as row_count
            FROM subscriptions
            GROUP BY church_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_subscription_per_church".to_string(),
                church_ids: vec![row.church_id],
                description: format!(
                    "Church has {} subscription rows (expected 1)",
                    row.row_count
                ),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Free-month conservation
    ///
    /// `used` may never exceed `earned`; a breach means a cycle consumed a
    /// month that was never credited.
    async fn check_free_month_conservation(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FreeMonthRow> = sqlx::query_as(
            r#"
            SELECT church_id, free_months_earned, free_months_used
            FROM subscriptions
            WHERE free_months_used > free_months_earned
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_month_conservation".to_string(),
                church_ids: vec![row.church_id],
                description: format!(
                    "free_months_used ({}) exceeds free_months_earned ({})",
                    row.free_months_used, row.free_months_earned
                ),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Grace clock only while past_due
    ///
    /// The suspension boundary is derived from this timestamp; a stale
    /// value on any other state would block or unblock the wrong tenants.
    async fn check_grace_only_while_past_due(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GraceRow> = sqlx::query_as(
            r#"
            SELECT church_id, state
            FROM subscriptions
            WHERE grace_period_end IS NOT NULL AND state != 'past_due'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grace_only_while_past_due".to_string(),
                church_ids: vec![row.church_id],
                description: format!(
                    "grace_period_end set while state is '{}'",
                    row.state
                ),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Paid payment entries carry a provider reference
    async fn check_paid_entries_have_reference(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnreferencedSettledRow> = sqlx::query_as(
            r#"
            SELECT id, church_id
            FROM ledger_entries
            WHERE entry_type = 'payment'
              AND status = 'paid'
              AND provider_reference IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_entries_have_reference".to_string(),
                church_ids: vec![row.church_id],
                description: format!(
                    "Ledger entry {} is paid with no provider reference",
                    row.id
                ),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Entry status belongs to the entry type's domain
    ///
    /// e.g. a free_month entry may only ever be 'rewarded'.
    async fn check_status_domain_by_type(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadStatusRow> = sqlx::query_as(
            r#"
            SELECT id, church_id, entry_type, status
            FROM ledger_entries
            WHERE NOT (
                (entry_type = 'payment' AND status IN ('pending', 'paid', 'failed'))
                OR (entry_type = 'invoice' AND status IN ('pending', 'paid', 'unpaid'))
                OR (entry_type = 'free_month' AND status = 'rewarded')
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "status_domain_by_type".to_string(),
                church_ids: vec![row.church_id],
                description: format!(
                    "Ledger entry {} of type '{}' carries out-of-domain status '{}'",
                    row.id, row.entry_type, row.status
                ),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "one_subscription_per_church",
            "free_month_conservation",
            "grace_only_while_past_due",
            "paid_entries_have_reference",
            "status_domain_by_type",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"free_month_conservation"));
        assert!(checks.contains(&"one_subscription_per_church"));
    }
}
