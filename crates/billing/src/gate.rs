//! Feature gate
//!
//! Read-only decision function consulted by every tenant-facing request
//! before a gated write: given the subscription state and plan, decide
//! allow/deny and which module set is visible. Side-effect free, at most
//! one subscription/plan read per request, never writes.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plan::{Plan, PlanName};
use crate::policy::GracePolicy;
use crate::subscription::{Subscription, SubscriptionState};

/// Coarse module groups of the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureModule {
    Members,
    Events,
    Ministries,
    Finance,
    Reports,
    Branches,
}

impl FeatureModule {
    pub const ALL: [FeatureModule; 6] = [
        FeatureModule::Members,
        FeatureModule::Events,
        FeatureModule::Ministries,
        FeatureModule::Finance,
        FeatureModule::Reports,
        FeatureModule::Branches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureModule::Members => "members",
            FeatureModule::Events => "events",
            FeatureModule::Ministries => "ministries",
            FeatureModule::Finance => "finance",
            FeatureModule::Reports => "reports",
            FeatureModule::Branches => "branches",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "members" => Ok(FeatureModule::Members),
            "events" => Ok(FeatureModule::Events),
            "ministries" => Ok(FeatureModule::Ministries),
            "finance" => Ok(FeatureModule::Finance),
            "reports" => Ok(FeatureModule::Reports),
            "branches" => Ok(FeatureModule::Branches),
            _ => Err(BillingError::InvalidField {
                field: "module",
                value: raw.to_string(),
            }),
        }
    }

    /// Plan-level entitlement: finance needs standard or premium; reports
    /// and branches need premium; everything else runs on any plan.
    fn allowed_on(&self, plan: PlanName) -> bool {
        match self {
            FeatureModule::Finance => {
                matches!(plan, PlanName::Standard | PlanName::Premium)
            }
            FeatureModule::Reports | FeatureModule::Branches => plan == PlanName::Premium,
            _ => true,
        }
    }
}

/// Whether the subscription's financial standing blocks gated writes:
/// suspended, or past_due with the grace window lapsed. Tenants see this as
/// a single payment-required signal either way.
pub fn financially_blocked(sub: &Subscription, now: OffsetDateTime) -> bool {
    sub.state == SubscriptionState::Suspended || GracePolicy::grace_expired(sub, now)
}

/// The per-request gate decision.
pub fn is_allowed(sub: &Subscription, module: FeatureModule, now: OffsetDateTime) -> bool {
    if financially_blocked(sub, now) {
        return false;
    }
    // A trial gets full feature access regardless of what plan is on file.
    let effective = if sub.state == SubscriptionState::Trialing {
        PlanName::Premium
    } else {
        match sub.plan {
            Some(plan) => plan,
            None => return module.allowed_on(PlanName::FreeLite),
        }
    };
    module.allowed_on(effective)
}

/// Module set visible to the tenant, from the catalog plan's feature flags.
/// Trials see everything.
pub fn visible_modules(sub: &Subscription, plan: Option<&Plan>) -> Vec<FeatureModule> {
    if sub.state == SubscriptionState::Trialing {
        return FeatureModule::ALL.to_vec();
    }
    let Some(plan) = plan else {
        return vec![
            FeatureModule::Members,
            FeatureModule::Events,
            FeatureModule::Ministries,
        ];
    };
    FeatureModule::ALL
        .into_iter()
        .filter(|m| match m {
            FeatureModule::Members => plan.features.members,
            FeatureModule::Events => plan.features.events,
            FeatureModule::Ministries => plan.features.ministries,
            FeatureModule::Finance => plan.features.finance,
            FeatureModule::Reports => plan.features.reports,
            FeatureModule::Branches => plan.features.branches,
        })
        .collect()
}
