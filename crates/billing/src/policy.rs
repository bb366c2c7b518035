//! Grace / suspension policy
//!
//! Shared decision logic for the billing cycle processor and the webhook
//! processor. A failed charge moves the subscription to `past_due` and
//! starts the grace clock; suspension is a derived read-time fact
//! (`now > grace_period_end`), never a stored state, so the boundary is
//! always evaluated against the latest clock.

use time::{Duration, OffsetDateTime};

use crate::subscription::{Subscription, SubscriptionState};

#[derive(Debug, Clone, Copy)]
pub struct GracePolicy {
    /// Tenant-independent global setting, not per-plan.
    pub grace_period_days: u32,
}

impl GracePolicy {
    pub fn new(grace_period_days: u32) -> Self {
        Self { grace_period_days }
    }

    /// Apply a failed charge: `past_due` with a fresh grace clock.
    pub fn on_payment_failure(&self, sub: &mut Subscription, now: OffsetDateTime) {
        sub.state = SubscriptionState::PastDue;
        sub.grace_period_end = Some(now + Duration::days(i64::from(self.grace_period_days)));
    }

    /// Whether the grace window has lapsed without recovery.
    pub fn grace_expired(sub: &Subscription, now: OffsetDateTime) -> bool {
        sub.state == SubscriptionState::PastDue
            && sub.grace_period_end.is_some_and(|end| now > end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_subscription;
    use time::macros::datetime;

    #[test]
    fn failure_starts_the_grace_clock() {
        let now = datetime!(2024-06-01 00:00 UTC);
        let mut sub = sample_subscription();
        GracePolicy::new(7).on_payment_failure(&mut sub, now);
        assert_eq!(sub.state, SubscriptionState::PastDue);
        assert_eq!(sub.grace_period_end, Some(datetime!(2024-06-08 00:00 UTC)));
    }

    #[test]
    fn grace_expiry_is_a_strict_boundary() {
        let end = datetime!(2024-06-08 00:00 UTC);
        let mut sub = sample_subscription();
        sub.state = SubscriptionState::PastDue;
        sub.grace_period_end = Some(end);

        assert!(!GracePolicy::grace_expired(&sub, end - Duration::seconds(1)));
        assert!(!GracePolicy::grace_expired(&sub, end));
        assert!(GracePolicy::grace_expired(&sub, end + Duration::seconds(1)));
    }

    #[test]
    fn grace_expiry_requires_past_due() {
        let mut sub = sample_subscription();
        sub.state = SubscriptionState::Active;
        sub.grace_period_end = None;
        assert!(!GracePolicy::grace_expired(&sub, OffsetDateTime::now_utc()));
    }
}
