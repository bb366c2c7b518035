//! Shared test fixtures.

use time::macros::datetime;
use uuid::Uuid;

use crate::plan::{FeatureCategories, Plan, PlanName, PlanPrice};
use crate::subscription::{BillingInterval, Subscription, SubscriptionState};

/// An active monthly GHS subscription on the standard plan, due in a month.
pub(crate) fn sample_subscription() -> Subscription {
    let now = datetime!(2024-06-01 00:00 UTC);
    Subscription {
        id: Uuid::new_v4(),
        church_id: Uuid::new_v4(),
        state: SubscriptionState::Active,
        plan: Some(PlanName::Standard),
        pending_plan: None,
        trial_start: None,
        trial_end: None,
        billing_interval: BillingInterval::Monthly,
        next_billing_date: datetime!(2024-07-01 00:00 UTC),
        currency: "GHS".to_string(),
        grace_period_end: None,
        free_months_earned: 0,
        free_months_used: 0,
        expiry_warning_shown: false,
        expiry_warning_notified_at: None,
        payment_methods: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

/// The four canonical plans with GHS pricing across all intervals.
pub(crate) fn catalog() -> Vec<Plan> {
    let features = |finance, reports, branches| FeatureCategories {
        members: true,
        events: true,
        ministries: true,
        finance,
        reports,
        branches,
    };
    let prices = |monthly: i64| {
        vec![
            PlanPrice {
                currency: "GHS".to_string(),
                interval: BillingInterval::Monthly,
                amount_cents: monthly,
            },
            PlanPrice {
                currency: "GHS".to_string(),
                interval: BillingInterval::HalfYear,
                amount_cents: monthly * 5,
            },
            PlanPrice {
                currency: "GHS".to_string(),
                interval: BillingInterval::Yearly,
                amount_cents: monthly * 10,
            },
        ]
    };
    vec![
        Plan {
            name: PlanName::FreeLite,
            features: features(false, false, false),
            prices: vec![],
        },
        Plan {
            name: PlanName::Basic,
            features: features(false, false, false),
            prices: prices(2500),
        },
        Plan {
            name: PlanName::Standard,
            features: features(true, false, false),
            prices: prices(5000),
        },
        Plan {
            name: PlanName::Premium,
            features: features(true, true, true),
            prices: prices(10000),
        },
    ]
}
