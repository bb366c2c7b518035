//! Referral ledger
//!
//! Tracks referrer -> referred relationships and a one-shot reward flag per
//! referred church. The reward transition is a conditional update that only
//! succeeds while the record is still `pending`, so two concurrent webhook
//! deliveries cannot double-credit the referrer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    Rewarded,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Rewarded => "rewarded",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "pending" => Ok(RewardStatus::Pending),
            "rewarded" => Ok(RewardStatus::Rewarded),
            _ => Err(BillingError::InvalidField {
                field: "reward_status",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferralRecord {
    pub id: Uuid,
    pub referrer_church: Uuid,
    pub referred_church: Uuid,
    pub reward_status: RewardStatus,
    /// Set once the referrer has spent the month this referral funded.
    pub reward_consumed: bool,
    pub referred_at: OffsetDateTime,
    pub subscribed_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait ReferralStore: Send + Sync {
    /// Record a referral; at most one per referred church, ever.
    async fn link(
        &self,
        referrer_church: Uuid,
        referred_church: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ReferralRecord>;

    async fn find_by_referred(
        &self,
        referred_church: Uuid,
    ) -> BillingResult<Option<ReferralRecord>>;

    /// Atomically flip `pending -> rewarded`, stamping `subscribed_at`.
    /// Returns the updated record when this caller won the flip, `None`
    /// when the record was absent or already rewarded.
    async fn mark_rewarded_if_pending(
        &self,
        referred_church: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ReferralRecord>>;

    /// Mark the referrer's oldest unconsumed reward as spent; called when a
    /// billing cycle is satisfied by a free month.
    async fn mark_oldest_reward_consumed(&self, referrer_church: Uuid) -> BillingResult<bool>;
}
