use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing::pricing;
use crate::billing::processors::{Processor, ProcessorRegistry};

use super::models::{
    Invoice, InvoiceStatus, PromoCode, SettlementTransaction, SETTLEMENT_KIND_PAYMENT,
    SETTLEMENT_KIND_REFUND,
};

/// key: billing-ledger -> invoice state machine over conditional updates
///
/// Every transition is a compare-and-set: the update only lands when the
/// current status is in the expected predecessor set, which is what makes
/// duplicate webhook deliveries and concurrent manual overrides collapse to
/// no-ops instead of double settlements.
#[derive(Clone)]
pub struct InvoiceLedger {
    pool: PgPool,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
}

/// A creation collision means the period is already billed; callers treat it
/// as a skip, never an error.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Invoice),
    AlreadyBilled,
}

#[derive(Debug, Clone)]
pub struct SettlementInput {
    pub processor: String,
    pub external_payment_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug)]
pub enum PaidOutcome {
    Applied {
        invoice: Invoice,
        settlement: SettlementTransaction,
    },
    AlreadyPaid,
    NotFound,
    NotPayable(String),
}

#[derive(Debug)]
pub enum VoidOutcome {
    Voided {
        invoice: Invoice,
        /// Set when the processor-side refund failed after the local VOID
        /// already landed; ledger state and processor money have diverged
        /// and need manual follow-up.
        refund_warning: Option<String>,
    },
    AlreadyVoid,
    NotFound,
    NotVoidable(String),
}

#[derive(Debug)]
pub enum PromoRedemption {
    Redeemed(PromoCode),
    Invalid(&'static str),
}

impl InvoiceLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn invoices_for_subscription(&self, subscription_id: Uuid) -> Result<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE subscription_id = $1 ORDER BY billing_period_start DESC",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Creation is guarded by the UNIQUE (subscription_id,
    /// billing_period_start) index; a conflicting insert reports
    /// `AlreadyBilled` so overlapping billing runs stay idempotent.
    pub async fn create_invoice(&self, new: NewInvoice) -> Result<CreateOutcome> {
        let row = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                id,
                tenant_id,
                subscription_id,
                amount_cents,
                currency,
                billing_period_start,
                billing_period_end,
                due_date,
                status,
                notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (subscription_id, billing_period_start) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.subscription_id)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(new.billing_period_start)
        .bind(new.billing_period_end)
        .bind(new.due_date)
        .bind(InvoiceStatus::Pending.as_str())
        .bind(&new.notes)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(invoice) => CreateOutcome::Created(invoice),
            None => CreateOutcome::AlreadyBilled,
        })
    }

    /// The conditional-update primitive behind every transition. Returns the
    /// updated row, or `None` when the current status was outside `expected`.
    pub async fn transition(
        &self,
        invoice_id: Uuid,
        expected: &[InvoiceStatus],
        next: InvoiceStatus,
        note: Option<&str>,
    ) -> Result<Option<Invoice>> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2,
                notes = COALESCE($4, notes),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .bind(next.as_str())
        .bind(&expected)
        .bind(note)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Settles an invoice: stamps `paid_at`, records the settlement, updates
    /// the subscription's payment recency, clears the dunning counter and
    /// grants the plan's period credits. A second delivery of the same
    /// `succeeded` event finds the invoice already PAID and reports
    /// `AlreadyPaid` without touching anything.
    pub async fn mark_paid(
        &self,
        invoice_id: Uuid,
        settlement: SettlementInput,
        paid_at: DateTime<Utc>,
    ) -> Result<PaidOutcome> {
        let mut tx = self.pool.begin().await?;

        let payable = [
            InvoiceStatus::Pending,
            InvoiceStatus::PastDue,
            InvoiceStatus::Failed,
        ];
        let expected: Vec<String> = payable.iter().map(|s| s.as_str().to_string()).collect();
        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2, paid_at = $3, updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Paid.as_str())
        .bind(paid_at)
        .bind(&expected)
        .fetch_optional(&mut tx)
        .await?;

        let Some(invoice) = updated else {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1")
                    .bind(invoice_id)
                    .fetch_optional(&mut tx)
                    .await?;
            tx.rollback().await?;
            return Ok(match current.as_deref() {
                None => PaidOutcome::NotFound,
                Some("paid") => PaidOutcome::AlreadyPaid,
                Some(other) => PaidOutcome::NotPayable(other.to_string()),
            });
        };

        let settlement = sqlx::query_as::<_, SettlementTransaction>(
            r#"
            INSERT INTO settlement_transactions (
                id, tenant_id, invoice_id, processor, external_payment_id,
                amount_cents, currency, kind
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice.tenant_id)
        .bind(invoice.id)
        .bind(&settlement.processor)
        .bind(&settlement.external_payment_id)
        .bind(settlement.amount_cents)
        .bind(&settlement.currency)
        .bind(SETTLEMENT_KIND_PAYMENT)
        .fetch_one(&mut tx)
        .await?;

        sqlx::query("UPDATE invoices SET settlement_transaction_id = $2 WHERE id = $1")
            .bind(invoice.id)
            .bind(settlement.id)
            .execute(&mut tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions s
            SET last_payment_date = $2,
                retry_count = 0,
                credit_balance = s.credit_balance + p.period_credits,
                updated_at = NOW()
            FROM plans p
            WHERE s.id = $1 AND p.id = s.plan_id
            "#,
        )
        .bind(invoice.subscription_id)
        .bind(paid_at.date_naive())
        .execute(&mut tx)
        .await?;

        tx.commit().await?;

        let mut invoice = invoice;
        invoice.settlement_transaction_id = Some(settlement.id);
        Ok(PaidOutcome::Applied {
            invoice,
            settlement,
        })
    }

    /// Voids an invoice. Voiding a PAID invoice reverses its side effects:
    /// the granted period credits are revoked, a refund settlement row is
    /// recorded, and (for processor-captured payments, when requested) a
    /// processor-side refund is issued AFTER the local transaction commits,
    /// so no lock is held across the network call. A refund failure leaves
    /// the local VOID in place and comes back as `refund_warning`.
    pub async fn void_invoice(
        &self,
        invoice_id: Uuid,
        registry: Option<&ProcessorRegistry>,
        issue_processor_refund: bool,
        note: Option<&str>,
    ) -> Result<VoidOutcome> {
        let Some(invoice) = self.invoice(invoice_id).await? else {
            return Ok(VoidOutcome::NotFound);
        };

        match invoice.status() {
            Some(InvoiceStatus::Void) => return Ok(VoidOutcome::AlreadyVoid),
            Some(InvoiceStatus::Paid) => {}
            Some(_) => {
                let voided = self
                    .transition(
                        invoice_id,
                        &[
                            InvoiceStatus::Pending,
                            InvoiceStatus::PastDue,
                            InvoiceStatus::Failed,
                        ],
                        InvoiceStatus::Void,
                        note,
                    )
                    .await?;
                return Ok(match voided {
                    Some(invoice) => VoidOutcome::Voided {
                        invoice,
                        refund_warning: None,
                    },
                    // lost a race against another transition; report the
                    // state we now observe
                    None => VoidOutcome::AlreadyVoid,
                });
            }
            None => return Ok(VoidOutcome::NotVoidable(invoice.status.clone())),
        }

        // reversal path: PAID -> VOID
        let mut tx = self.pool.begin().await?;

        let voided = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $2, notes = COALESCE($3, notes), updated_at = NOW()
            WHERE id = $1 AND status = $4
            RETURNING *
            "#,
        )
        .bind(invoice_id)
        .bind(InvoiceStatus::Void.as_str())
        .bind(note)
        .bind(InvoiceStatus::Paid.as_str())
        .fetch_optional(&mut tx)
        .await?;

        let Some(voided) = voided else {
            tx.rollback().await?;
            return Ok(VoidOutcome::AlreadyVoid);
        };

        sqlx::query(
            r#"
            UPDATE subscriptions s
            SET credit_balance = GREATEST(s.credit_balance - p.period_credits, 0),
                updated_at = NOW()
            FROM plans p
            WHERE s.id = $1 AND p.id = s.plan_id
            "#,
        )
        .bind(voided.subscription_id)
        .execute(&mut tx)
        .await?;

        let payment: Option<SettlementTransaction> = sqlx::query_as(
            "SELECT * FROM settlement_transactions \
             WHERE invoice_id = $1 AND kind = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(invoice_id)
        .bind(SETTLEMENT_KIND_PAYMENT)
        .fetch_optional(&mut tx)
        .await?;

        if let Some(payment) = &payment {
            sqlx::query(
                r#"
                INSERT INTO settlement_transactions (
                    id, tenant_id, invoice_id, processor, external_payment_id,
                    amount_cents, currency, kind
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(payment.tenant_id)
            .bind(invoice_id)
            .bind(&payment.processor)
            .bind(&payment.external_payment_id)
            .bind(payment.amount_cents)
            .bind(&payment.currency)
            .bind(SETTLEMENT_KIND_REFUND)
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;

        let mut refund_warning = None;
        if issue_processor_refund {
            if let Some(payment) = &payment {
                match Processor::parse(&payment.processor) {
                    Some(processor) => {
                        let adapter = registry.and_then(|registry| registry.adapter(processor));
                        match adapter {
                            Some(adapter) => {
                                if let Err(err) = adapter
                                    .refund(
                                        &payment.external_payment_id,
                                        payment.amount_cents,
                                        &payment.currency,
                                    )
                                    .await
                                {
                                    tracing::error!(
                                        invoice = %invoice_id,
                                        payment = %payment.external_payment_id,
                                        ?err,
                                        "invoice voided locally but processor refund failed; manual follow-up required"
                                    );
                                    refund_warning = Some(format!(
                                        "processor refund failed for {}: {err}",
                                        payment.external_payment_id
                                    ));
                                }
                            }
                            None => {
                                refund_warning = Some(format!(
                                    "no {} credentials configured; refund {} manually",
                                    payment.processor, payment.external_payment_id
                                ));
                            }
                        }
                    }
                    // manual settlements have no processor-side money to move
                    None => {}
                }
            }
        }

        Ok(VoidOutcome::Voided {
            invoice: voided,
            refund_warning,
        })
    }

    /// Grace sweep: open invoices whose due date plus the tenant grace window
    /// has elapsed become PAST_DUE. Returns the freshly flipped rows so the
    /// caller can notify.
    pub async fn sweep_past_due(
        &self,
        tenant_id: Uuid,
        today: NaiveDate,
        grace_days: i32,
    ) -> Result<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = $4, updated_at = NOW()
            WHERE tenant_id = $1
              AND status = ANY($5)
              AND due_date + $3 < $2
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(today)
        .bind(grace_days)
        .bind(InvoiceStatus::PastDue.as_str())
        .bind(vec![
            InvoiceStatus::Pending.as_str().to_string(),
            InvoiceStatus::Failed.as_str().to_string(),
        ])
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Resolves a settlement (and its invoice) from a processor payment id;
    /// used for events that carry no invoice metadata, e.g. refunds started
    /// from the provider dashboard.
    pub async fn find_settled_invoice(
        &self,
        tenant_id: Uuid,
        processor: &str,
        external_payment_id: &str,
    ) -> Result<Option<(SettlementTransaction, Invoice)>> {
        let settlement: Option<SettlementTransaction> = sqlx::query_as(
            "SELECT * FROM settlement_transactions \
             WHERE tenant_id = $1 AND processor = $2 AND external_payment_id = $3 AND kind = $4 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .bind(processor)
        .bind(external_payment_id)
        .bind(SETTLEMENT_KIND_PAYMENT)
        .fetch_optional(&self.pool)
        .await?;

        let Some(settlement) = settlement else {
            return Ok(None);
        };
        let invoice = self.invoice(settlement.invoice_id).await?;
        Ok(invoice.map(|invoice| (settlement, invoice)))
    }

    /// Records the checkout session handle an invoice is being paid through
    /// so the status poller can find its way back.
    pub async fn attach_checkout_session(
        &self,
        invoice_id: Uuid,
        processor: Processor,
        session_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE invoices SET checkout_session_id = $2, checkout_processor = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(invoice_id)
        .bind(session_id)
        .bind(processor.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn invoice_by_checkout_session(&self, session_id: &str) -> Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE checkout_session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Redeems a promo code. Validation runs against a freshly loaded row and
    /// the increment is conditional on the cap, so two concurrent enrollments
    /// racing for the last redemption cannot both win.
    pub async fn redeem_promo(
        &self,
        tenant_id: Uuid,
        code: &str,
        plan_id: Uuid,
        plan_price_cents: i64,
        today: NaiveDate,
    ) -> Result<PromoRedemption> {
        let promo: Option<PromoCode> = sqlx::query_as(
            "SELECT * FROM promo_codes WHERE tenant_id = $1 AND code = $2",
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        let Some(promo) = promo else {
            return Ok(PromoRedemption::Invalid("unknown-code"));
        };

        let outcome = pricing::validate_promo(&promo, plan_id, plan_price_cents, today);
        if !outcome.valid {
            return Ok(PromoRedemption::Invalid(
                outcome.reason.unwrap_or("invalid"),
            ));
        }

        let redeemed: Option<PromoCode> = sqlx::query_as(
            r#"
            UPDATE promo_codes
            SET redemption_count = redemption_count + 1
            WHERE id = $1 AND redemption_count < max_redemptions
            RETURNING *
            "#,
        )
        .bind(promo.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match redeemed {
            Some(promo) => PromoRedemption::Redeemed(promo),
            None => PromoRedemption::Invalid("redemption-cap-reached"),
        })
    }
}
