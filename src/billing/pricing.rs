use chrono::NaiveDate;
use uuid::Uuid;

use super::models::{Plan, PromoCode, Subscription, PROMO_DISCOUNT_PERCENT};

/// key: billing-pricing -> effective price for one billing period
///
/// `family_cohort_size` is the number of other active subscriptions sharing
/// the member's family group; the family discount only kicks in when at least
/// two linked members are billed alongside this one.
pub fn effective_price(
    subscription: &Subscription,
    plan: &Plan,
    billing_period_start: NaiveDate,
    family_cohort_size: usize,
) -> i64 {
    let base = match subscription.price_override_cents {
        None => plan.price_cents,
        Some(override_cents) if !subscription.first_period_discount_only => override_cents,
        Some(override_cents) => {
            let offset = (billing_period_start - subscription.started_at).num_days().abs();
            if offset <= 1 {
                override_cents
            } else {
                plan.price_cents
            }
        }
    };

    if family_cohort_size >= 2 && plan.family_discount_percent > 0 {
        let percent = i64::from(plan.family_discount_percent.clamp(0, 100));
        (base * (100 - percent) / 100).max(0)
    } else {
        base.max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoOutcome {
    pub valid: bool,
    pub discount_cents: i64,
    pub reason: Option<&'static str>,
}

impl PromoOutcome {
    fn rejected(reason: &'static str) -> Self {
        PromoOutcome {
            valid: false,
            discount_cents: 0,
            reason: Some(reason),
        }
    }
}

/// Validates a promo code against a plan at a point in time. Callers must
/// evaluate a freshly loaded row at redemption time; the redemption cap is
/// additionally enforced by the conditional update in
/// [`super::ledger::redeem_promo`] so concurrent enrollments cannot
/// over-redeem.
pub fn validate_promo(
    promo: &PromoCode,
    plan_id: Uuid,
    plan_price_cents: i64,
    today: NaiveDate,
) -> PromoOutcome {
    if !promo.active {
        return PromoOutcome::rejected("inactive");
    }
    if today < promo.valid_from || today > promo.valid_until {
        return PromoOutcome::rejected("outside-validity-window");
    }
    if !promo.applicable_plan_ids.is_empty() && !promo.applicable_plan_ids.contains(&plan_id) {
        return PromoOutcome::rejected("plan-not-applicable");
    }
    if promo.redemption_count >= promo.max_redemptions {
        return PromoOutcome::rejected("redemption-cap-reached");
    }

    PromoOutcome {
        valid: true,
        discount_cents: promo_discount(promo, plan_price_cents),
        reason: None,
    }
}

/// Discount a promo grants against a plan price, independent of validity.
pub fn promo_discount(promo: &PromoCode, plan_price_cents: i64) -> i64 {
    let discount = if promo.discount_type == PROMO_DISCOUNT_PERCENT {
        plan_price_cents * promo.discount_value.clamp(0, 100) / 100
    } else {
        promo.discount_value.min(plan_price_cents)
    };
    discount.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::{PROMO_DISCOUNT_FIXED, PROMO_DISCOUNT_PERCENT};
    use chrono::{NaiveDate, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn plan(price_cents: i64, family_discount_percent: i32) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Adult Unlimited".into(),
            price_cents,
            currency: "usd".into(),
            billing_cycle: "monthly".into(),
            auto_renew: true,
            family_discount_percent,
            rank_discount_percent: 0,
            period_credits: 0,
            cancellation_terms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn subscription(
        override_cents: Option<i64>,
        first_period_only: bool,
        started_at: NaiveDate,
    ) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            customer_name: "Jordan Avery".into(),
            customer_email: "jordan@example.com".into(),
            status: "active".into(),
            started_at,
            next_charge_date: started_at,
            price_override_cents: override_cents,
            first_period_discount_only: first_period_only,
            retry_count: 0,
            next_retry_date: None,
            last_payment_date: None,
            family_group_id: None,
            processor: None,
            processor_customer_ref: None,
            credit_balance: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn plan_price_when_no_override() {
        let plan = plan(10000, 0);
        let sub = subscription(None, false, date(2026, 1, 1));
        assert_eq!(effective_price(&sub, &plan, date(2026, 1, 1), 0), 10000);
    }

    #[test]
    fn override_applies_every_period_when_not_first_period_only() {
        let plan = plan(10000, 0);
        let sub = subscription(Some(7500), false, date(2026, 1, 1));
        assert_eq!(effective_price(&sub, &plan, date(2026, 6, 1), 0), 7500);
    }

    #[test]
    fn first_period_only_override_reverts_to_plan_price_afterwards() {
        let plan = plan(10000, 0);
        let start = date(2026, 1, 1);
        let sub = subscription(Some(500), true, start);
        assert_eq!(effective_price(&sub, &plan, start, 0), 500);
        // the window is one day wide on either side of the start date
        assert_eq!(effective_price(&sub, &plan, date(2026, 1, 2), 0), 500);
        assert_eq!(effective_price(&sub, &plan, date(2026, 2, 1), 0), 10000);
    }

    #[test]
    fn same_inputs_always_yield_the_same_price() {
        let plan = plan(12500, 10);
        let sub = subscription(Some(9900), true, date(2026, 3, 10));
        let a = effective_price(&sub, &plan, date(2026, 4, 10), 3);
        let b = effective_price(&sub, &plan, date(2026, 4, 10), 3);
        assert_eq!(a, b);
    }

    #[test]
    fn family_discount_needs_at_least_two_linked_members() {
        let plan = plan(10000, 20);
        let sub = subscription(None, false, date(2026, 1, 1));
        assert_eq!(effective_price(&sub, &plan, date(2026, 2, 1), 1), 10000);
        assert_eq!(effective_price(&sub, &plan, date(2026, 2, 1), 2), 8000);
    }

    #[test]
    fn family_discount_floors_at_zero() {
        let mut plan = plan(100, 100);
        plan.family_discount_percent = 150;
        let sub = subscription(None, false, date(2026, 1, 1));
        assert_eq!(effective_price(&sub, &plan, date(2026, 2, 1), 4), 0);
    }

    fn promo(
        discount_type: &str,
        value: i64,
        max_redemptions: i32,
        redemption_count: i32,
    ) -> PromoCode {
        PromoCode {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            code: "SUMMER26".into(),
            discount_type: discount_type.into(),
            discount_value: value,
            valid_from: date(2026, 6, 1),
            valid_until: date(2026, 8, 31),
            max_redemptions,
            redemption_count,
            applicable_plan_ids: vec![],
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn promo_percent_discount_within_window() {
        let p = promo(PROMO_DISCOUNT_PERCENT, 25, 100, 0);
        let outcome = validate_promo(&p, Uuid::new_v4(), 10000, date(2026, 7, 1));
        assert!(outcome.valid);
        assert_eq!(outcome.discount_cents, 2500);
    }

    #[test]
    fn promo_fixed_discount_is_capped_at_plan_price() {
        let p = promo(PROMO_DISCOUNT_FIXED, 15000, 100, 0);
        let outcome = validate_promo(&p, Uuid::new_v4(), 10000, date(2026, 7, 1));
        assert!(outcome.valid);
        assert_eq!(outcome.discount_cents, 10000);
    }

    #[test]
    fn promo_rejections() {
        let expired = promo(PROMO_DISCOUNT_PERCENT, 10, 100, 0);
        assert!(!validate_promo(&expired, Uuid::new_v4(), 10000, date(2026, 9, 1)).valid);

        let mut inactive = promo(PROMO_DISCOUNT_PERCENT, 10, 100, 0);
        inactive.active = false;
        assert!(!validate_promo(&inactive, Uuid::new_v4(), 10000, date(2026, 7, 1)).valid);

        let exhausted = promo(PROMO_DISCOUNT_PERCENT, 10, 5, 5);
        let outcome = validate_promo(&exhausted, Uuid::new_v4(), 10000, date(2026, 7, 1));
        assert_eq!(outcome.reason, Some("redemption-cap-reached"));

        let mut scoped = promo(PROMO_DISCOUNT_PERCENT, 10, 100, 0);
        scoped.applicable_plan_ids = vec![Uuid::new_v4()];
        assert!(!validate_promo(&scoped, Uuid::new_v4(), 10000, date(2026, 7, 1)).valid);
    }
}
