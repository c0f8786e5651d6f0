use anyhow::Result;
use chrono::{Duration, NaiveDate};
use sqlx::PgPool;
use uuid::Uuid;

use crate::notify::NotifyHandle;

use super::models::SubscriptionStatus;

/// key: billing-dunning -> failed-payment escalation schedule

const RETRY_SCHEDULE_DAYS: [i64; 4] = [3, 7, 14, 30];

/// Days to wait before the next charge attempt. Attempts past the end of the
/// schedule keep the final 30-day spacing.
pub fn retry_delay_days(retry_count: i32) -> i64 {
    if retry_count < 0 {
        return RETRY_SCHEDULE_DAYS[0];
    }
    let idx = (retry_count as usize).min(RETRY_SCHEDULE_DAYS.len() - 1);
    RETRY_SCHEDULE_DAYS[idx]
}

pub fn next_retry_date(now: NaiveDate, retry_count: i32) -> NaiveDate {
    now + Duration::days(retry_delay_days(retry_count))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationLevel {
    Friendly,
    Urgent,
    Final,
    Suspension,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::Friendly => "friendly",
            EscalationLevel::Urgent => "urgent",
            EscalationLevel::Final => "final",
            EscalationLevel::Suspension => "suspension",
        }
    }
}

pub fn escalation_level(retry_count: i32) -> EscalationLevel {
    match retry_count {
        i32::MIN..=1 => EscalationLevel::Friendly,
        2 => EscalationLevel::Urgent,
        3 => EscalationLevel::Final,
        _ => EscalationLevel::Suspension,
    }
}

/// `max_retries = 0` suspends at the first failure; that edge case is
/// intentional.
pub fn should_suspend(retry_count: i32, max_retries: i32) -> bool {
    retry_count >= max_retries
}

#[derive(Debug, Clone)]
pub struct DunningOutcome {
    pub retry_count: i32,
    pub level: EscalationLevel,
    pub suspended: bool,
    pub next_retry: Option<NaiveDate>,
}

/// key: billing-dunning-engine -> apply one failed charge attempt
///
/// Bumps the retry counter, notifies at the resulting escalation level and
/// either schedules the next attempt or suspends the subscription. Suspension
/// stops all automatic billing; only a manual reactivation resumes it.
pub async fn record_failed_attempt(
    pool: &PgPool,
    notify: &NotifyHandle,
    subscription_id: Uuid,
    max_retries: i32,
    today: NaiveDate,
) -> Result<Option<DunningOutcome>> {
    let row: Option<(i32, String, String)> = sqlx::query_as(
        "UPDATE subscriptions SET retry_count = retry_count + 1, updated_at = NOW() \
         WHERE id = $1 AND status = $2 \
         RETURNING retry_count, customer_email, status",
    )
    .bind(subscription_id)
    .bind(SubscriptionStatus::Active.as_str())
    .fetch_optional(pool)
    .await?;

    let Some((retry_count, customer_email, _)) = row else {
        // cancelled or already suspended subscriptions take no further attempts
        return Ok(None);
    };

    let level = escalation_level(retry_count);
    let suspended = should_suspend(retry_count, max_retries);

    let outcome = if suspended {
        sqlx::query(
            "UPDATE subscriptions SET status = $2, next_retry_date = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(SubscriptionStatus::Suspended.as_str())
        .execute(pool)
        .await?;
        tracing::warn!(
            subscription = %subscription_id,
            retry_count,
            "subscription suspended after exhausting payment retries"
        );
        DunningOutcome {
            retry_count,
            level,
            suspended: true,
            next_retry: None,
        }
    } else {
        // delay is indexed by the attempt that just failed (first failure
        // waits 3 days); escalation is judged on the new counter. The retry
        // cursor is separate from next_charge_date so the billing period
        // anchor never drifts on failures.
        let next_retry = next_retry_date(today, retry_count - 1);
        sqlx::query(
            "UPDATE subscriptions SET next_retry_date = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(next_retry)
        .execute(pool)
        .await?;
        DunningOutcome {
            retry_count,
            level,
            suspended: false,
            next_retry: Some(next_retry),
        }
    };

    notify.dispatch(
        &format!("dunning.{}", outcome.level.as_str()),
        &customer_email,
        serde_json::json!({
            "subscription_id": subscription_id,
            "retry_count": outcome.retry_count,
            "next_retry": outcome.next_retry,
            "suspended": outcome.suspended,
        }),
    );

    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn retry_schedule_matches_published_cadence() {
        assert_eq!(retry_delay_days(0), 3);
        assert_eq!(retry_delay_days(1), 7);
        assert_eq!(retry_delay_days(2), 14);
        assert_eq!(retry_delay_days(3), 30);
    }

    #[test]
    fn retry_schedule_repeats_final_spacing() {
        assert_eq!(retry_delay_days(4), 30);
        assert_eq!(retry_delay_days(10), 30);
    }

    #[test]
    fn next_retry_adds_schedule_days() {
        let today = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        assert_eq!(
            next_retry_date(today, 0),
            NaiveDate::from_ymd_opt(2026, 5, 4).unwrap()
        );
        assert_eq!(
            next_retry_date(today, 10),
            NaiveDate::from_ymd_opt(2026, 5, 31).unwrap()
        );
    }

    #[test]
    fn escalation_mapping() {
        assert_eq!(escalation_level(0), EscalationLevel::Friendly);
        assert_eq!(escalation_level(1), EscalationLevel::Friendly);
        assert_eq!(escalation_level(2), EscalationLevel::Urgent);
        assert_eq!(escalation_level(3), EscalationLevel::Final);
        assert_eq!(escalation_level(4), EscalationLevel::Suspension);
        assert_eq!(escalation_level(10), EscalationLevel::Suspension);
    }

    #[test]
    fn zero_max_retries_suspends_immediately() {
        assert!(should_suspend(0, 0));
        assert!(!should_suspend(0, 1));
        assert!(should_suspend(4, 4));
        assert!(!should_suspend(3, 4));
    }
}
