use std::collections::HashMap;

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::notify::NotifyHandle;
use crate::settings::TenantBillingSettings;

use super::dunning;
use super::ledger::{CreateOutcome, InvoiceLedger, NewInvoice};
use super::models::{Invoice, InvoiceStatus, Plan, Subscription, SubscriptionStatus};
use super::pricing;
use super::processors::{Processor, ProcessorRegistry};

/// key: billing-scheduler -> periodic invoice generation loop
pub fn spawn(pool: PgPool, notify: NotifyHandle) {
    let interval = TokioDuration::from_secs(*config::BILLING_RUN_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();
            match run_billing_cycle(&pool, &notify, today).await {
                Ok(outcome) => info!(
                    created = outcome.created,
                    skipped = outcome.skipped,
                    total = outcome.total,
                    errors = outcome.errors.len(),
                    "scheduled billing run finished"
                ),
                Err(err) => warn!(?err, "scheduled billing run failed"),
            }
        }
    });
}

#[derive(Debug, Default, Serialize)]
pub struct BillingRunOutcome {
    pub created: usize,
    pub skipped: usize,
    pub total: usize,
    pub errors: Vec<String>,
}

/// key: billing-scheduler-tick -> one pass over every due subscription
///
/// Safe to run concurrently with itself: invoice creation is keyed on
/// (subscription_id, billing_period_start), so an overlapping run observes a
/// collision and counts a skip. One subscription's failure is recorded and
/// never aborts the rest of the batch.
pub async fn run_billing_cycle(
    pool: &PgPool,
    notify: &NotifyHandle,
    today: NaiveDate,
) -> Result<BillingRunOutcome> {
    let ledger = InvoiceLedger::new(pool.clone());
    let mut outcome = BillingRunOutcome::default();

    let tenants: Vec<Uuid> =
        sqlx::query_scalar("SELECT DISTINCT tenant_id FROM subscriptions")
            .fetch_all(pool)
            .await?;

    for tenant_id in tenants {
        let settings = TenantBillingSettings::load(pool, tenant_id).await?;
        let registry = ProcessorRegistry::from_settings(&settings);

        if let Err(err) = bill_tenant(
            pool,
            &ledger,
            notify,
            &settings,
            &registry,
            today,
            &mut outcome,
        )
        .await
        {
            warn!(?err, %tenant_id, "billing pass failed for tenant");
            outcome.errors.push(format!("tenant {tenant_id}: {err}"));
        }

        if let Err(err) = retry_tenant(
            pool,
            &ledger,
            notify,
            &settings,
            &registry,
            today,
            &mut outcome,
        )
        .await
        {
            warn!(?err, %tenant_id, "dunning retry pass failed for tenant");
            outcome.errors.push(format!("tenant {tenant_id} retries: {err}"));
        }

        match ledger
            .sweep_past_due(tenant_id, today, settings.grace_period_days)
            .await
        {
            Ok(flipped) => {
                for invoice in flipped {
                    notify_invoice(pool, notify, "invoice.past_due", &invoice).await;
                }
            }
            Err(err) => {
                warn!(?err, %tenant_id, "past-due sweep failed");
                outcome.errors.push(format!("tenant {tenant_id} sweep: {err}"));
            }
        }
    }

    Ok(outcome)
}

async fn bill_tenant(
    pool: &PgPool,
    ledger: &InvoiceLedger,
    notify: &NotifyHandle,
    settings: &TenantBillingSettings,
    registry: &ProcessorRegistry,
    today: NaiveDate,
    outcome: &mut BillingRunOutcome,
) -> Result<()> {
    let plans: Vec<Plan> = sqlx::query_as("SELECT * FROM plans WHERE tenant_id = $1")
        .bind(settings.tenant_id)
        .fetch_all(pool)
        .await?;
    let plans: HashMap<Uuid, Plan> = plans.into_iter().map(|plan| (plan.id, plan)).collect();

    let due: Vec<Subscription> = sqlx::query_as(
        "SELECT * FROM subscriptions \
         WHERE tenant_id = $1 AND status = $2 AND next_charge_date <= $3 \
         ORDER BY next_charge_date ASC",
    )
    .bind(settings.tenant_id)
    .bind(SubscriptionStatus::Active.as_str())
    .bind(today)
    .fetch_all(pool)
    .await?;

    for subscription in due {
        outcome.total += 1;
        if let Err(err) = bill_subscription(
            pool,
            ledger,
            notify,
            settings,
            registry,
            &plans,
            &subscription,
            today,
            outcome,
        )
        .await
        {
            warn!(
                ?err,
                subscription = %subscription.id,
                "failed to bill subscription; continuing with the rest of the batch"
            );
            outcome
                .errors
                .push(format!("subscription {}: {err}", subscription.id));
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn bill_subscription(
    pool: &PgPool,
    ledger: &InvoiceLedger,
    notify: &NotifyHandle,
    settings: &TenantBillingSettings,
    registry: &ProcessorRegistry,
    plans: &HashMap<Uuid, Plan>,
    subscription: &Subscription,
    today: NaiveDate,
    outcome: &mut BillingRunOutcome,
) -> Result<()> {
    let Some(plan) = plans.get(&subscription.plan_id) else {
        anyhow::bail!("plan {} not found", subscription.plan_id);
    };
    if !plan.auto_renew {
        debug!(subscription = %subscription.id, "plan does not auto-renew; skipping");
        return Ok(());
    }

    let cycle = plan.cycle();
    let period_start = subscription.next_charge_date;
    let period_end = cycle.period_end(period_start);
    let due_date = period_start + Duration::days(i64::from(settings.grace_period_days));

    let cohort = family_cohort_size(pool, subscription).await?;
    let amount_cents = pricing::effective_price(subscription, plan, period_start, cohort);

    let created = ledger
        .create_invoice(NewInvoice {
            tenant_id: subscription.tenant_id,
            subscription_id: subscription.id,
            amount_cents,
            currency: plan.currency.clone(),
            billing_period_start: period_start,
            billing_period_end: period_end,
            due_date,
            notes: None,
        })
        .await?;

    // advance even on a collision: a collision means an earlier run already
    // created the invoice but may have stopped before moving the cursor
    sqlx::query(
        "UPDATE subscriptions SET next_charge_date = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(subscription.id)
    .bind(cycle.advance(period_start))
    .execute(pool)
    .await?;

    let invoice = match created {
        CreateOutcome::Created(invoice) => invoice,
        CreateOutcome::AlreadyBilled => {
            debug!(
                subscription = %subscription.id,
                period_start = %period_start,
                "period already billed; skipping"
            );
            outcome.skipped += 1;
            return Ok(());
        }
    };
    outcome.created += 1;
    info!(
        invoice = %invoice.id,
        subscription = %subscription.id,
        amount_cents,
        period_start = %period_start,
        "invoice created"
    );
    notify_invoice(pool, notify, "invoice.created", &invoice).await;

    // auto-billing: kick off the charge and let the webhook settle it later
    if let (Some(processor), Some(customer_ref)) = (
        subscription.processor.as_deref().and_then(Processor::parse),
        subscription.processor_customer_ref.as_deref(),
    ) {
        let Some(adapter) = registry.adapter(processor) else {
            anyhow::bail!(
                "subscription {} uses {} but the tenant has no credentials for it",
                subscription.id,
                processor.as_str()
            );
        };
        let mut metadata = HashMap::new();
        metadata.insert("invoice_id".to_string(), invoice.id.to_string());
        match adapter
            .charge_off_session(customer_ref, amount_cents, &plan.currency, &metadata)
            .await
        {
            Ok(charge) => {
                info!(
                    invoice = %invoice.id,
                    payment = %charge.external_payment_id,
                    "off-session charge initiated"
                );
            }
            Err(err) => {
                warn!(?err, invoice = %invoice.id, "off-session charge failed");
                ledger
                    .transition(
                        invoice.id,
                        &[InvoiceStatus::Pending],
                        InvoiceStatus::Failed,
                        Some(&format!("off-session charge failed: {err}")),
                    )
                    .await?;
                dunning::record_failed_attempt(
                    pool,
                    notify,
                    subscription.id,
                    settings.max_retries,
                    today,
                )
                .await?;
                outcome
                    .errors
                    .push(format!("subscription {}: {err}", subscription.id));
            }
        }
    }

    Ok(())
}

/// Dunning retry sweep: subscriptions whose retry date has arrived get one
/// more off-session attempt against their most recent open invoice. The
/// invoice is re-opened to PENDING first so the attempt's outcome lands on
/// the pending -> failed gate and advances the dunning counter exactly once.
async fn retry_tenant(
    pool: &PgPool,
    ledger: &InvoiceLedger,
    notify: &NotifyHandle,
    settings: &TenantBillingSettings,
    registry: &ProcessorRegistry,
    today: NaiveDate,
    outcome: &mut BillingRunOutcome,
) -> Result<()> {
    let retryable: Vec<Subscription> = sqlx::query_as(
        "SELECT * FROM subscriptions \
         WHERE tenant_id = $1 AND status = $2 \
           AND next_retry_date IS NOT NULL AND next_retry_date <= $3 \
           AND processor IS NOT NULL AND processor_customer_ref IS NOT NULL",
    )
    .bind(settings.tenant_id)
    .bind(SubscriptionStatus::Active.as_str())
    .bind(today)
    .fetch_all(pool)
    .await?;

    for subscription in retryable {
        sqlx::query(
            "UPDATE subscriptions SET next_retry_date = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription.id)
        .execute(pool)
        .await?;

        let open: Option<Invoice> = sqlx::query_as(
            "SELECT * FROM invoices \
             WHERE subscription_id = $1 AND status = ANY($2) \
             ORDER BY billing_period_start DESC LIMIT 1",
        )
        .bind(subscription.id)
        .bind(vec![
            InvoiceStatus::Pending.as_str().to_string(),
            InvoiceStatus::Failed.as_str().to_string(),
            InvoiceStatus::PastDue.as_str().to_string(),
        ])
        .fetch_optional(pool)
        .await?;

        let Some(invoice) = open else {
            debug!(subscription = %subscription.id, "retry due but nothing left to collect");
            continue;
        };

        if let Err(err) = retry_charge(
            pool,
            ledger,
            notify,
            settings,
            registry,
            &subscription,
            &invoice,
            today,
        )
        .await
        {
            warn!(?err, subscription = %subscription.id, "dunning retry attempt failed");
            outcome
                .errors
                .push(format!("subscription {} retry: {err}", subscription.id));
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn retry_charge(
    pool: &PgPool,
    ledger: &InvoiceLedger,
    notify: &NotifyHandle,
    settings: &TenantBillingSettings,
    registry: &ProcessorRegistry,
    subscription: &Subscription,
    invoice: &Invoice,
    today: NaiveDate,
) -> Result<()> {
    let processor = subscription
        .processor
        .as_deref()
        .and_then(Processor::parse)
        .ok_or_else(|| anyhow::anyhow!("subscription has no usable processor"))?;
    let customer_ref = subscription
        .processor_customer_ref
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("subscription has no processor customer ref"))?;
    let Some(adapter) = registry.adapter(processor) else {
        anyhow::bail!("tenant has no {} credentials", processor.as_str());
    };

    ledger
        .transition(
            invoice.id,
            &[InvoiceStatus::Failed, InvoiceStatus::PastDue],
            InvoiceStatus::Pending,
            None,
        )
        .await?;

    let mut metadata = HashMap::new();
    metadata.insert("invoice_id".to_string(), invoice.id.to_string());
    match adapter
        .charge_off_session(customer_ref, invoice.amount_cents, &invoice.currency, &metadata)
        .await
    {
        Ok(charge) => {
            info!(
                invoice = %invoice.id,
                payment = %charge.external_payment_id,
                "dunning retry charge initiated"
            );
            Ok(())
        }
        Err(err) => {
            ledger
                .transition(
                    invoice.id,
                    &[InvoiceStatus::Pending],
                    InvoiceStatus::Failed,
                    Some(&format!("retry charge failed: {err}")),
                )
                .await?;
            dunning::record_failed_attempt(
                pool,
                notify,
                subscription.id,
                settings.max_retries,
                today,
            )
            .await?;
            Err(err)
        }
    }
}

/// Other active subscriptions sharing the member's family group; the family
/// discount needs at least two of them.
async fn family_cohort_size(pool: &PgPool, subscription: &Subscription) -> Result<usize> {
    let Some(family_group_id) = subscription.family_group_id else {
        return Ok(0);
    };
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM subscriptions \
         WHERE family_group_id = $1 AND status = $2 AND id <> $3",
    )
    .bind(family_group_id)
    .bind(SubscriptionStatus::Active.as_str())
    .bind(subscription.id)
    .fetch_one(pool)
    .await?;
    Ok(count.max(0) as usize)
}

async fn notify_invoice(pool: &PgPool, notify: &NotifyHandle, event_key: &str, invoice: &Invoice) {
    let email: Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT customer_email FROM subscriptions WHERE id = $1")
            .bind(invoice.subscription_id)
            .fetch_optional(pool)
            .await;
    match email {
        Ok(Some(email)) => notify.dispatch(
            event_key,
            &email,
            serde_json::json!({
                "invoice_id": invoice.id,
                "amount_cents": invoice.amount_cents,
                "due_date": invoice.due_date,
            }),
        ),
        Ok(None) => {}
        Err(err) => warn!(?err, invoice = %invoice.id, "failed to resolve notification recipient"),
    }
}
