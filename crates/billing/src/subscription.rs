//! Subscription record and lifecycle state
//!
//! One record per church. The two writers are the billing cycle processor
//! and the payment webhook processor; everything else reads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plan::PlanName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Trialing,
    Active,
    PastDue,
    Suspended,
    Cancelled,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Trialing => "trialing",
            SubscriptionState::Active => "active",
            SubscriptionState::PastDue => "past_due",
            SubscriptionState::Suspended => "suspended",
            SubscriptionState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "trialing" => Ok(SubscriptionState::Trialing),
            "active" => Ok(SubscriptionState::Active),
            "past_due" => Ok(SubscriptionState::PastDue),
            "suspended" => Ok(SubscriptionState::Suspended),
            "cancelled" => Ok(SubscriptionState::Cancelled),
            _ => Err(BillingError::InvalidField {
                field: "state",
                value: raw.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    HalfYear,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::HalfYear => "half_year",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn parse(raw: &str) -> BillingResult<Self> {
        match raw {
            "monthly" => Ok(BillingInterval::Monthly),
            "half_year" => Ok(BillingInterval::HalfYear),
            "yearly" => Ok(BillingInterval::Yearly),
            _ => Err(BillingError::InvalidField {
                field: "billing_interval",
                value: raw.to_string(),
            }),
        }
    }

    pub fn months(&self) -> i32 {
        match self {
            BillingInterval::Monthly => 1,
            BillingInterval::HalfYear => 6,
            BillingInterval::Yearly => 12,
        }
    }
}

/// Fingerprinted payment-method descriptor. Card data is reduced to
/// brand/last4/expiry at the boundary; full PANs never reach storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentMethod {
    Card {
        brand: String,
        last4: String,
        exp_month: u8,
        exp_year: u16,
    },
    MobileMoney {
        provider: String,
        phone: String,
    },
}

impl PaymentMethod {
    /// Stable fingerprint used to deduplicate methods on a subscription.
    pub fn fingerprint(&self) -> String {
        let material = match self {
            PaymentMethod::Card {
                brand,
                last4,
                exp_month,
                exp_year,
            } => format!("card:{brand}:{last4}:{exp_month}:{exp_year}"),
            PaymentMethod::MobileMoney { provider, phone } => {
                format!("momo:{provider}:{phone}")
            }
        };
        hex::encode(Sha256::digest(material.to_lowercase().as_bytes()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub church_id: Uuid,
    pub state: SubscriptionState,
    /// Nullable during trial; set on first plan selection or paid conversion.
    pub plan: Option<PlanName>,
    /// Plan scheduled to take effect at the next billing boundary.
    pub pending_plan: Option<PlanName>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub billing_interval: BillingInterval,
    /// The batch processor's selection key.
    pub next_billing_date: OffsetDateTime,
    pub currency: String,
    /// Non-null only while `state == past_due`.
    pub grace_period_end: Option<OffsetDateTime>,
    pub free_months_earned: i32,
    pub free_months_used: i32,
    /// One-shot renewal-warning latch, reset on every successful cycle.
    pub expiry_warning_shown: bool,
    pub expiry_warning_notified_at: Option<OffsetDateTime>,
    pub payment_methods: Vec<PaymentMethod>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn free_months_remaining(&self) -> i32 {
        self.free_months_earned - self.free_months_used
    }

    /// Append a payment method unless one with the same fingerprint exists.
    /// Returns whether the method was added.
    pub fn add_payment_method(&mut self, method: PaymentMethod) -> bool {
        let fingerprint = method.fingerprint();
        if self
            .payment_methods
            .iter()
            .any(|m| m.fingerprint() == fingerprint)
        {
            return false;
        }
        self.payment_methods.push(method);
        true
    }
}

/// Persistence seam for subscriptions. Transitions that race between the
/// batch processor and the webhook processor are expressed as conditional
/// updates whose boolean result is the success signal.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, sub: &Subscription) -> BillingResult<()>;

    async fn find_by_church(&self, church_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Subscriptions due for billing: `next_billing_date <= now` and not
    /// cancelled or suspended.
    async fn due_for_billing(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    async fn update(&self, sub: &Subscription) -> BillingResult<()>;

    /// Consume one earned free month: increments `used`, advances the
    /// billing date, reactivates the subscription, clears the grace clock
    /// and the warning latch. Succeeds only while `used < earned`.
    async fn consume_free_month(
        &self,
        church_id: Uuid,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Credit one earned free month (referral reward).
    async fn add_free_month(&self, church_id: Uuid) -> BillingResult<bool>;

    /// Promote `pending_plan` to `plan` if one is scheduled.
    async fn promote_pending_plan(&self, church_id: Uuid) -> BillingResult<bool>;

    /// One-shot warning latch; succeeds only if the latch was unset.
    async fn mark_expiry_warning_shown(
        &self,
        church_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Billable subscriptions due before `cutoff` whose warning latch is
    /// still unset.
    async fn expiry_warning_candidates(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_case() {
        let a = PaymentMethod::Card {
            brand: "Visa".to_string(),
            last4: "4242".to_string(),
            exp_month: 9,
            exp_year: 2027,
        };
        let b = PaymentMethod::Card {
            brand: "visa".to_string(),
            last4: "4242".to_string(),
            exp_month: 9,
            exp_year: 2027,
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_methods() {
        let card = PaymentMethod::Card {
            brand: "visa".to_string(),
            last4: "4242".to_string(),
            exp_month: 9,
            exp_year: 2027,
        };
        let momo = PaymentMethod::MobileMoney {
            provider: "mtn".to_string(),
            phone: "+233201234567".to_string(),
        };
        assert_ne!(card.fingerprint(), momo.fingerprint());
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            SubscriptionState::Trialing,
            SubscriptionState::Active,
            SubscriptionState::PastDue,
            SubscriptionState::Suspended,
            SubscriptionState::Cancelled,
        ] {
            assert_eq!(SubscriptionState::parse(state.as_str()).unwrap(), state);
        }
        assert!(SubscriptionState::parse("grace_expired").is_err());
    }

    #[test]
    fn interval_months() {
        assert_eq!(BillingInterval::Monthly.months(), 1);
        assert_eq!(BillingInterval::HalfYear.months(), 6);
        assert_eq!(BillingInterval::Yearly.months(), 12);
    }
}
