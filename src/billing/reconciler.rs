use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::notify::NotifyHandle;
use crate::settings::TenantBillingSettings;

use super::dunning;
use super::ledger::{InvoiceLedger, PaidOutcome, SettlementInput, VoidOutcome};
use super::models::InvoiceStatus;
use super::processors::{Processor, ProcessorEvent};

/// key: billing-reconciler -> apply normalized processor events exactly once
///
/// Exactly-once is a property of the ledger's conditional transitions, not of
/// an event dedupe table: redelivered events land on a state that no longer
/// matches their expected predecessor and collapse to no-ops.
pub struct Reconciler {
    pool: PgPool,
    ledger: InvoiceLedger,
    notify: NotifyHandle,
}

/// How an event landed; the webhook layer maps this onto response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A ledger transition happened.
    Applied,
    /// The event had already been applied; acknowledged as a no-op.
    Duplicate,
    /// Transiently unresolvable (e.g. refund ahead of its payment); the
    /// caller answers non-2xx so the processor redelivers later.
    Deferred,
    /// Unknown kind or unresolvable target; acknowledged and dropped.
    Ignored,
}

impl Reconciler {
    pub fn new(pool: PgPool, notify: NotifyHandle) -> Self {
        let ledger = InvoiceLedger::new(pool.clone());
        Self {
            pool,
            ledger,
            notify,
        }
    }

    pub async fn apply(
        &self,
        tenant_id: Uuid,
        processor: Processor,
        settings: &TenantBillingSettings,
        event: ProcessorEvent,
    ) -> Result<ReconcileOutcome> {
        match event {
            ProcessorEvent::Succeeded {
                external_payment_id,
                amount_cents,
                currency,
                metadata,
            } => {
                self.apply_succeeded(
                    tenant_id,
                    processor,
                    external_payment_id,
                    amount_cents,
                    currency,
                    metadata.get("invoice_id").map(String::as_str),
                )
                .await
            }
            ProcessorEvent::Failed {
                external_payment_id,
                reason,
                metadata,
            } => {
                self.apply_failed(
                    tenant_id,
                    settings,
                    external_payment_id,
                    reason,
                    metadata.get("invoice_id").map(String::as_str),
                )
                .await
            }
            ProcessorEvent::Refunded {
                external_payment_id,
                ..
            } => self.apply_refunded(tenant_id, processor, external_payment_id).await,
            ProcessorEvent::Ignored { kind } => {
                info!(%tenant_id, kind, "acknowledged unhandled processor event");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn resolve_invoice_id(
        &self,
        tenant_id: Uuid,
        processor: Processor,
        external_payment_id: &str,
        metadata_invoice_id: Option<&str>,
    ) -> Result<Option<Uuid>> {
        if let Some(raw) = metadata_invoice_id {
            match Uuid::parse_str(raw) {
                Ok(id) => return Ok(Some(id)),
                Err(_) => {
                    warn!(%tenant_id, raw, "processor event carried a malformed invoice id");
                }
            }
        }
        // no usable metadata; fall back to the settlement trail
        let settled = self
            .ledger
            .find_settled_invoice(tenant_id, processor.as_str(), external_payment_id)
            .await?;
        Ok(settled.map(|(_, invoice)| invoice.id))
    }

    async fn apply_succeeded(
        &self,
        tenant_id: Uuid,
        processor: Processor,
        external_payment_id: String,
        amount_cents: i64,
        currency: String,
        metadata_invoice_id: Option<&str>,
    ) -> Result<ReconcileOutcome> {
        let invoice_id = self
            .resolve_invoice_id(tenant_id, processor, &external_payment_id, metadata_invoice_id)
            .await?;
        let Some(invoice_id) = invoice_id else {
            warn!(
                %tenant_id,
                payment = %external_payment_id,
                "succeeded event matched no invoice; acknowledged for manual review"
            );
            return Ok(ReconcileOutcome::Ignored);
        };

        let outcome = self
            .ledger
            .mark_paid(
                invoice_id,
                SettlementInput {
                    processor: processor.as_str().to_string(),
                    external_payment_id: external_payment_id.clone(),
                    amount_cents,
                    currency,
                },
                Utc::now(),
            )
            .await?;

        match outcome {
            PaidOutcome::Applied { invoice, .. } => {
                info!(
                    invoice = %invoice.id,
                    payment = %external_payment_id,
                    amount_cents,
                    "invoice settled from processor event"
                );
                self.notify_invoice_event("invoice.paid", &invoice.subscription_id, &invoice.id)
                    .await?;
                Ok(ReconcileOutcome::Applied)
            }
            PaidOutcome::AlreadyPaid => Ok(ReconcileOutcome::Duplicate),
            PaidOutcome::NotFound => {
                warn!(invoice = %invoice_id, "succeeded event referenced a missing invoice");
                Ok(ReconcileOutcome::Ignored)
            }
            PaidOutcome::NotPayable(status) => {
                warn!(
                    invoice = %invoice_id,
                    status,
                    payment = %external_payment_id,
                    "payment captured for an invoice that can no longer be paid; manual follow-up"
                );
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn apply_failed(
        &self,
        tenant_id: Uuid,
        settings: &TenantBillingSettings,
        external_payment_id: String,
        reason: String,
        metadata_invoice_id: Option<&str>,
    ) -> Result<ReconcileOutcome> {
        let Some(raw) = metadata_invoice_id else {
            warn!(
                %tenant_id,
                payment = %external_payment_id,
                "failed event carried no invoice metadata; acknowledged"
            );
            return Ok(ReconcileOutcome::Ignored);
        };
        let Ok(invoice_id) = Uuid::parse_str(raw) else {
            warn!(%tenant_id, raw, "failed event carried a malformed invoice id");
            return Ok(ReconcileOutcome::Ignored);
        };

        let note = format!("charge failed: {reason}");
        let flipped = self
            .ledger
            .transition(
                invoice_id,
                &[InvoiceStatus::Pending],
                InvoiceStatus::Failed,
                Some(&note),
            )
            .await?;

        let Some(invoice) = flipped else {
            // already failed, paid or swept past due; the dunning counter
            // must not advance twice for one logical failure
            return Ok(ReconcileOutcome::Duplicate);
        };

        info!(invoice = %invoice.id, reason, "invoice marked failed from processor event");
        let today = Utc::now().date_naive();
        dunning::record_failed_attempt(
            &self.pool,
            &self.notify,
            invoice.subscription_id,
            settings.max_retries,
            today,
        )
        .await?;
        Ok(ReconcileOutcome::Applied)
    }

    async fn apply_refunded(
        &self,
        tenant_id: Uuid,
        processor: Processor,
        external_payment_id: String,
    ) -> Result<ReconcileOutcome> {
        let settled = self
            .ledger
            .find_settled_invoice(tenant_id, processor.as_str(), &external_payment_id)
            .await?;

        let Some((_, invoice)) = settled else {
            // the succeeded event may still be in flight; ask for redelivery
            // instead of dropping the refund
            warn!(
                %tenant_id,
                payment = %external_payment_id,
                "refund arrived before its payment was recorded; deferring"
            );
            return Ok(ReconcileOutcome::Deferred);
        };

        if invoice.status() == Some(InvoiceStatus::Void) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        // money already moved back on the processor side; only reverse locally
        let outcome = self
            .ledger
            .void_invoice(invoice.id, None, false, Some("processor-initiated refund"))
            .await?;

        match outcome {
            VoidOutcome::Voided { invoice, .. } => {
                info!(invoice = %invoice.id, payment = %external_payment_id, "invoice voided from refund event");
                self.notify_invoice_event(
                    "invoice.refunded",
                    &invoice.subscription_id,
                    &invoice.id,
                )
                .await?;
                Ok(ReconcileOutcome::Applied)
            }
            VoidOutcome::AlreadyVoid => Ok(ReconcileOutcome::Duplicate),
            VoidOutcome::NotFound | VoidOutcome::NotVoidable(_) => Ok(ReconcileOutcome::Ignored),
        }
    }

    async fn notify_invoice_event(
        &self,
        event_key: &str,
        subscription_id: &Uuid,
        invoice_id: &Uuid,
    ) -> Result<()> {
        let email: Option<String> =
            sqlx::query_scalar("SELECT customer_email FROM subscriptions WHERE id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(email) = email {
            self.notify.dispatch(
                event_key,
                &email,
                serde_json::json!({ "invoice_id": invoice_id }),
            );
        }
        Ok(())
    }
}
