//! Plan catalog
//!
//! Read-mostly lookup of plan name to per-currency, per-interval price and
//! feature entitlements. Catalog rows are created and edited by external
//! admin CRUD; this engine only reads them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::subscription::BillingInterval;

/// The four canonical plan names, closed at the boundary. Incoming strings
/// are case- and space-normalized before matching; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(try_from = "String")]
pub enum PlanName {
    FreeLite,
    Basic,
    Standard,
    Premium,
}

impl PlanName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanName::FreeLite => "free_lite",
            PlanName::Basic => "basic",
            PlanName::Standard => "standard",
            PlanName::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "freelite" => Ok(PlanName::FreeLite),
            "basic" => Ok(PlanName::Basic),
            "standard" => Ok(PlanName::Standard),
            "premium" => Ok(PlanName::Premium),
            _ => Err(BillingError::PlanUnknown(raw.to_string())),
        }
    }
}

impl TryFrom<String> for PlanName {
    type Error = BillingError;

    fn try_from(raw: String) -> BillingResult<Self> {
        PlanName::parse(&raw)
    }
}

impl std::fmt::Display for PlanName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Boolean flags gating the coarse module groups a plan can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCategories {
    pub members: bool,
    pub events: bool,
    pub ministries: bool,
    pub finance: bool,
    pub reports: bool,
    pub branches: bool,
}

/// A catalog plan: canonical name, feature flags, and a price table keyed
/// by `(currency, interval)`.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub name: PlanName,
    pub features: FeatureCategories,
    pub prices: Vec<PlanPrice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPrice {
    pub currency: String,
    pub interval: BillingInterval,
    pub amount_cents: i64,
}

impl Plan {
    pub fn price(&self, currency: &str, interval: BillingInterval) -> Option<i64> {
        self.prices
            .iter()
            .find(|p| p.currency == currency && p.interval == interval)
            .map(|p| p.amount_cents)
    }
}

/// Read-only catalog access.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn find(&self, name: PlanName) -> BillingResult<Option<Plan>>;

    /// Price lookup for a charge. `None` means the admin catalog has no
    /// price for this combination and the cycle must skip the charge.
    async fn price(
        &self,
        name: PlanName,
        currency: &str,
        interval: BillingInterval,
    ) -> BillingResult<Option<i64>>;
}
