use std::collections::HashMap;

use backoffice::billing::processors::{Processor, ProcessorEvent};
use backoffice::billing::{InvoiceLedger, ReconcileOutcome, Reconciler, VoidOutcome};
use backoffice::notify::NotifyHandle;
use backoffice::settings::TenantBillingSettings;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

// key: ledger-tests -> exactly-once settlement and symmetric reversal

struct Fixture {
    tenant_id: Uuid,
    subscription_id: Uuid,
    invoice_id: Uuid,
}

async fn seed(pool: &PgPool) -> Fixture {
    let tenant_id = Uuid::new_v4();
    let today = Utc::now().date_naive();

    let plan_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO plans (id, tenant_id, name, price_cents, billing_cycle, period_credits) \
         VALUES ($1, $2, 'Adult Unlimited', 10000, 'monthly', 8)",
    )
    .bind(plan_id)
    .bind(tenant_id)
    .execute(pool)
    .await
    .unwrap();

    let subscription_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO subscriptions \
         (id, tenant_id, plan_id, customer_name, customer_email, status, started_at, next_charge_date, retry_count) \
         VALUES ($1, $2, $3, 'Jordan Avery', 'jordan@example.com', 'active', $4, $5, 2)",
    )
    .bind(subscription_id)
    .bind(tenant_id)
    .bind(plan_id)
    .bind(today - Duration::days(60))
    .bind(today)
    .execute(pool)
    .await
    .unwrap();

    let invoice_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO invoices \
         (id, tenant_id, subscription_id, amount_cents, billing_period_start, billing_period_end, due_date, status) \
         VALUES ($1, $2, $3, 10000, $4, $5, $6, 'pending')",
    )
    .bind(invoice_id)
    .bind(tenant_id)
    .bind(subscription_id)
    .bind(today)
    .bind(today + Duration::days(29))
    .bind(today + Duration::days(5))
    .execute(pool)
    .await
    .unwrap();

    Fixture {
        tenant_id,
        subscription_id,
        invoice_id,
    }
}

fn succeeded(fixture: &Fixture, payment_id: &str) -> ProcessorEvent {
    let mut metadata = HashMap::new();
    metadata.insert("invoice_id".to_string(), fixture.invoice_id.to_string());
    ProcessorEvent::Succeeded {
        external_payment_id: payment_id.to_string(),
        amount_cents: 10000,
        currency: "usd".to_string(),
        metadata,
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_succeeded_events_settle_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool).await;
    let settings = TenantBillingSettings::defaults(fixture.tenant_id);
    let reconciler = Reconciler::new(pool.clone(), NotifyHandle::null());

    let first = reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            succeeded(&fixture, "pay_1"),
        )
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);

    let second = reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            succeeded(&fixture, "pay_1"),
        )
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Duplicate);

    let (status, paid_at): (String, Option<chrono::DateTime<Utc>>) =
        sqlx::query_as("SELECT status, paid_at FROM invoices WHERE id = $1")
            .bind(fixture.invoice_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "paid");
    assert!(paid_at.is_some());

    let settlements: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM settlement_transactions WHERE invoice_id = $1")
            .bind(fixture.invoice_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(settlements, 1);

    // payment recency updated, dunning counter cleared, credits granted once
    let (retry_count, credit_balance): (i32, i32) =
        sqlx::query_as("SELECT retry_count, credit_balance FROM subscriptions WHERE id = $1")
            .bind(fixture.subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(retry_count, 0);
    assert_eq!(credit_balance, 8);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refund_ahead_of_its_payment_is_deferred(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool).await;
    let settings = TenantBillingSettings::defaults(fixture.tenant_id);
    let reconciler = Reconciler::new(pool.clone(), NotifyHandle::null());

    let outcome = reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            ProcessorEvent::Refunded {
                external_payment_id: "pay_unseen".to_string(),
                amount_cents: 10000,
                metadata: HashMap::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Deferred);

    // nothing changed while the refund waits for its payment
    let status: String = sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
        .bind(fixture.invoice_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "pending");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dashboard_refund_reverses_a_paid_invoice_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool).await;
    let settings = TenantBillingSettings::defaults(fixture.tenant_id);
    let reconciler = Reconciler::new(pool.clone(), NotifyHandle::null());

    reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            succeeded(&fixture, "pay_2"),
        )
        .await
        .unwrap();

    let refund = ProcessorEvent::Refunded {
        external_payment_id: "pay_2".to_string(),
        amount_cents: 10000,
        metadata: HashMap::new(),
    };
    let first = reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            refund.clone(),
        )
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);

    let second = reconciler
        .apply(fixture.tenant_id, Processor::NorthPay, &settings, refund)
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Duplicate);

    let status: String = sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
        .bind(fixture.invoice_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "void");

    // credits granted at settlement were revoked exactly once
    let credit_balance: i32 =
        sqlx::query_scalar("SELECT credit_balance FROM subscriptions WHERE id = $1")
            .bind(fixture.subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(credit_balance, 0);

    let kinds: Vec<String> = sqlx::query_scalar(
        "SELECT kind FROM settlement_transactions WHERE invoice_id = $1 ORDER BY kind",
    )
    .bind(fixture.invoice_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(kinds, vec!["payment".to_string(), "refund".to_string()]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_failed_events_advance_dunning_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool).await;
    let settings = TenantBillingSettings::defaults(fixture.tenant_id);
    let reconciler = Reconciler::new(pool.clone(), NotifyHandle::null());

    let mut metadata = HashMap::new();
    metadata.insert("invoice_id".to_string(), fixture.invoice_id.to_string());
    let failed = ProcessorEvent::Failed {
        external_payment_id: "pay_3".to_string(),
        reason: "card_declined".to_string(),
        metadata,
    };

    let first = reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            failed.clone(),
        )
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);

    let second = reconciler
        .apply(fixture.tenant_id, Processor::NorthPay, &settings, failed)
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Duplicate);

    let status: String = sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
        .bind(fixture.invoice_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "failed");

    // the fixture starts at retry_count = 2; one logical failure moves it to 3
    let retry_count: i32 =
        sqlx::query_scalar("SELECT retry_count FROM subscriptions WHERE id = $1")
            .bind(fixture.subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(retry_count, 3);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_event_kinds_are_acknowledged(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool).await;
    let settings = TenantBillingSettings::defaults(fixture.tenant_id);
    let reconciler = Reconciler::new(pool.clone(), NotifyHandle::null());

    let outcome = reconciler
        .apply(
            fixture.tenant_id,
            Processor::NorthPay,
            &settings,
            ProcessorEvent::Ignored {
                kind: "customer.updated".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Ignored);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn manual_void_of_an_open_invoice_needs_no_reversal(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let fixture = seed(&pool).await;
    let ledger = InvoiceLedger::new(pool.clone());

    let outcome = ledger
        .void_invoice(fixture.invoice_id, None, true, Some("member moved away"))
        .await
        .unwrap();
    match outcome {
        VoidOutcome::Voided {
            invoice,
            refund_warning,
        } => {
            assert_eq!(invoice.status, "void");
            assert!(refund_warning.is_none());
        }
        other => panic!("unexpected void outcome: {other:?}"),
    }

    let settlements: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM settlement_transactions WHERE invoice_id = $1")
            .bind(fixture.invoice_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(settlements, 0);
}
