use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::notify::NotifyHandle;
use crate::settings::TenantBillingSettings;

use super::ledger::{InvoiceLedger, PaidOutcome, SettlementInput, VoidOutcome};
use super::models::{Invoice, InvoiceStatus, SubscriptionStatus};
use super::pricing;
use super::processors::{CheckoutRequest, PollOutcome, Processor, ProcessorRegistry};
use super::scheduler::{self, BillingRunOutcome};

/// key: billing-api -> back office endpoints

/// Manual billing trigger; safe to call repeatedly or while the scheduled
/// run is in flight.
pub async fn run_billing(
    Extension(pool): Extension<PgPool>,
    Extension(notify): Extension<NotifyHandle>,
) -> AppResult<Json<BillingRunOutcome>> {
    let outcome = scheduler::run_billing_cycle(&pool, &notify, Utc::now().date_naive())
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub subscription_id: Uuid,
}

pub async fn list_invoices(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<ListInvoicesQuery>,
) -> AppResult<Json<Vec<Invoice>>> {
    let ledger = InvoiceLedger::new(pool);
    let invoices = ledger
        .invoices_for_subscription(query.subscription_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(Json(invoices))
}

#[derive(Debug, Deserialize)]
pub struct PatchInvoiceRequest {
    pub status: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvoiceEnvelope {
    pub invoice: Invoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_warning: Option<String>,
}

/// Manual ledger override. PAID records a settlement and notifies the
/// member; VOID on a paid invoice runs the full reversal, surfacing a
/// `refund_warning` when the processor-side refund could not be issued.
pub async fn patch_invoice(
    Extension(pool): Extension<PgPool>,
    Extension(notify): Extension<NotifyHandle>,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<PatchInvoiceRequest>,
) -> AppResult<Json<InvoiceEnvelope>> {
    let target = InvoiceStatus::parse(&payload.status)
        .ok_or_else(|| AppError::BadRequest(format!("unknown status {}", payload.status)))?;
    let ledger = InvoiceLedger::new(pool.clone());
    let invoice = ledger
        .invoice(invoice_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?
        .ok_or(AppError::NotFound)?;

    match target {
        InvoiceStatus::Paid => {
            let method = payload.payment_method.as_deref().unwrap_or("manual");
            let outcome = ledger
                .mark_paid(
                    invoice_id,
                    SettlementInput {
                        processor: method.to_string(),
                        external_payment_id: format!("manual-{}", Uuid::new_v4()),
                        amount_cents: invoice.amount_cents,
                        currency: invoice.currency.clone(),
                    },
                    Utc::now(),
                )
                .await
                .map_err(|err| AppError::Message(err.to_string()))?;
            match outcome {
                PaidOutcome::Applied { invoice, .. } => {
                    notify_member(&pool, &notify, "payment.received", &invoice).await;
                    Ok(Json(InvoiceEnvelope {
                        invoice,
                        refund_warning: None,
                    }))
                }
                // duplicate overrides are no-ops, not errors
                PaidOutcome::AlreadyPaid => Ok(Json(InvoiceEnvelope {
                    invoice,
                    refund_warning: None,
                })),
                PaidOutcome::NotFound => Err(AppError::NotFound),
                PaidOutcome::NotPayable(status) => Err(AppError::BadRequest(format!(
                    "invoice in status {status} cannot be marked paid"
                ))),
            }
        }
        InvoiceStatus::Void => {
            let settings = TenantBillingSettings::load(&pool, invoice.tenant_id)
                .await
                .map_err(|err| AppError::Message(err.to_string()))?;
            let registry = ProcessorRegistry::from_settings(&settings);
            let outcome = ledger
                .void_invoice(invoice_id, Some(&registry), true, payload.note.as_deref())
                .await
                .map_err(|err| AppError::Message(err.to_string()))?;
            match outcome {
                VoidOutcome::Voided {
                    invoice,
                    refund_warning,
                } => Ok(Json(InvoiceEnvelope {
                    invoice,
                    refund_warning,
                })),
                VoidOutcome::AlreadyVoid => Ok(Json(InvoiceEnvelope {
                    invoice,
                    refund_warning: None,
                })),
                VoidOutcome::NotFound => Err(AppError::NotFound),
                VoidOutcome::NotVoidable(status) => Err(AppError::BadRequest(format!(
                    "invoice in status {status} cannot be voided"
                ))),
            }
        }
        InvoiceStatus::Failed => {
            let flipped = ledger
                .transition(
                    invoice_id,
                    &[InvoiceStatus::Pending],
                    InvoiceStatus::Failed,
                    payload.note.as_deref(),
                )
                .await
                .map_err(|err| AppError::Message(err.to_string()))?;
            match flipped {
                Some(invoice) => Ok(Json(InvoiceEnvelope {
                    invoice,
                    refund_warning: None,
                })),
                None => Err(AppError::BadRequest(format!(
                    "invoice in status {} cannot be marked failed",
                    invoice.status
                ))),
            }
        }
        InvoiceStatus::PastDue => {
            let flipped = ledger
                .transition(
                    invoice_id,
                    &[InvoiceStatus::Pending, InvoiceStatus::Failed],
                    InvoiceStatus::PastDue,
                    payload.note.as_deref(),
                )
                .await
                .map_err(|err| AppError::Message(err.to_string()))?;
            match flipped {
                Some(invoice) => Ok(Json(InvoiceEnvelope {
                    invoice,
                    refund_warning: None,
                })),
                None => Err(AppError::BadRequest(format!(
                    "invoice in status {} cannot be marked past due",
                    invoice.status
                ))),
            }
        }
        InvoiceStatus::Pending => Err(AppError::BadRequest(
            "invoices cannot be moved back to pending".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub processor: String,
}

#[derive(Debug, Serialize)]
pub struct CreateCheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
}

/// Creates a hosted checkout session for an open invoice and remembers the
/// session handle so the status poller can settle it later.
pub async fn create_invoice_checkout(
    Extension(pool): Extension<PgPool>,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<CreateCheckoutRequest>,
) -> AppResult<Json<CreateCheckoutResponse>> {
    let processor = Processor::parse(&payload.processor)
        .ok_or_else(|| AppError::BadRequest(format!("unknown processor {}", payload.processor)))?;
    let ledger = InvoiceLedger::new(pool.clone());
    let invoice = ledger
        .invoice(invoice_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?
        .ok_or(AppError::NotFound)?;

    match invoice.status() {
        Some(InvoiceStatus::Pending)
        | Some(InvoiceStatus::PastDue)
        | Some(InvoiceStatus::Failed) => {}
        _ => {
            return Err(AppError::BadRequest(format!(
                "invoice in status {} is not payable",
                invoice.status
            )))
        }
    }

    let settings = TenantBillingSettings::load(&pool, invoice.tenant_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    let registry = ProcessorRegistry::from_settings(&settings);
    let adapter = registry.adapter(processor).ok_or_else(|| {
        AppError::BadRequest(format!(
            "tenant has no {} credentials",
            processor.as_str()
        ))
    })?;

    let mut metadata = HashMap::new();
    metadata.insert("invoice_id".to_string(), invoice.id.to_string());
    let session = adapter
        .create_checkout(CheckoutRequest {
            amount_cents: invoice.amount_cents,
            currency: invoice.currency.clone(),
            success_url: settings.checkout_success_url.clone(),
            cancel_url: settings.checkout_cancel_url.clone(),
            metadata,
        })
        .await
        .map_err(|err| AppError::BadGateway(err.to_string()))?;

    ledger
        .attach_checkout_session(invoice.id, processor, &session.session_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;

    Ok(Json(CreateCheckoutResponse {
        checkout_url: session.checkout_url,
        session_id: session.session_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutStatusQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_id: Option<Uuid>,
}

/// Cache of checkout sessions that have reached a stable state, so the ~2s
/// client poll loop stops touching the processor and the ledger once a
/// session resolves.
pub type ResolvedCheckouts = Arc<DashMap<String, CheckoutStatusResponse>>;

/// Synchronous poll behind the payment popup. The first poll that observes
/// completion settles the invoice; later polls hit the cache or collapse
/// against the already-PAID ledger row.
pub async fn checkout_status(
    Extension(pool): Extension<PgPool>,
    Extension(notify): Extension<NotifyHandle>,
    Extension(resolved): Extension<ResolvedCheckouts>,
    Query(query): Query<CheckoutStatusQuery>,
) -> AppResult<Json<CheckoutStatusResponse>> {
    let session_id = query
        .session_id
        .or(query.order_id)
        .ok_or_else(|| AppError::BadRequest("session_id or order_id required".to_string()))?;

    if let Some(entry) = resolved.get(&session_id) {
        return Ok(Json(entry.clone()));
    }

    let ledger = InvoiceLedger::new(pool.clone());
    let invoice = ledger
        .invoice_by_checkout_session(&session_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?
        .ok_or(AppError::NotFound)?;
    let processor = invoice
        .checkout_processor
        .as_deref()
        .and_then(Processor::parse)
        .ok_or_else(|| AppError::Message("invoice has no checkout processor".to_string()))?;

    let settings = TenantBillingSettings::load(&pool, invoice.tenant_id)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    let registry = ProcessorRegistry::from_settings(&settings);
    let adapter = registry
        .adapter(processor)
        .ok_or_else(|| AppError::Message("processor credentials missing".to_string()))?;

    let outcome = adapter
        .poll_status(&session_id)
        .await
        .map_err(|err| AppError::BadGateway(err.to_string()))?;

    let response = match outcome {
        PollOutcome::Pending => CheckoutStatusResponse {
            status: "pending".to_string(),
            settlement_id: None,
        },
        PollOutcome::Expired => CheckoutStatusResponse {
            status: "expired".to_string(),
            settlement_id: None,
        },
        PollOutcome::Failed => CheckoutStatusResponse {
            status: "failed".to_string(),
            settlement_id: None,
        },
        PollOutcome::Complete {
            external_payment_id,
            ..
        } => {
            let paid = ledger
                .mark_paid(
                    invoice.id,
                    SettlementInput {
                        processor: processor.as_str().to_string(),
                        external_payment_id,
                        amount_cents: invoice.amount_cents,
                        currency: invoice.currency.clone(),
                    },
                    Utc::now(),
                )
                .await
                .map_err(|err| AppError::Message(err.to_string()))?;
            let settlement_id = match paid {
                PaidOutcome::Applied {
                    invoice, settlement, ..
                } => {
                    notify_member(&pool, &notify, "payment.received", &invoice).await;
                    Some(settlement.id)
                }
                // webhook beat the poll to it; report the recorded settlement
                PaidOutcome::AlreadyPaid => ledger
                    .invoice(invoice.id)
                    .await
                    .map_err(|err| AppError::Message(err.to_string()))?
                    .and_then(|invoice| invoice.settlement_transaction_id),
                PaidOutcome::NotFound => return Err(AppError::NotFound),
                PaidOutcome::NotPayable(status) => {
                    return Err(AppError::Message(format!(
                        "completed checkout for invoice in status {status}"
                    )))
                }
            };
            CheckoutStatusResponse {
                status: "complete".to_string(),
                settlement_id,
            }
        }
    };

    if response.status != "pending" {
        resolved.insert(session_id, response.clone());
    }
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct ReactivateResponse {
    pub subscription_id: Uuid,
    pub status: String,
}

/// Suspension is fatal to automatic billing; this is the human action that
/// brings a subscription back.
pub async fn reactivate_subscription(
    Extension(pool): Extension<PgPool>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<ReactivateResponse>> {
    let row: Option<(Uuid, String)> = sqlx::query_as(
        "UPDATE subscriptions \
         SET status = $2, retry_count = 0, next_charge_date = CURRENT_DATE, updated_at = NOW() \
         WHERE id = $1 AND status = $3 \
         RETURNING id, status",
    )
    .bind(subscription_id)
    .bind(SubscriptionStatus::Active.as_str())
    .bind(SubscriptionStatus::Suspended.as_str())
    .fetch_optional(&pool)
    .await?;

    match row {
        Some((id, status)) => Ok(Json(ReactivateResponse {
            subscription_id: id,
            status,
        })),
        None => {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1")
                    .bind(subscription_id)
                    .fetch_optional(&pool)
                    .await?;
            match exists {
                None => Err(AppError::NotFound),
                Some(status) => Err(AppError::BadRequest(format!(
                    "subscription in status {status} cannot be reactivated"
                ))),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PromoQuery {
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PromoResponse {
    pub valid: bool,
    pub discount_cents: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub async fn validate_promo_code(
    Extension(pool): Extension<PgPool>,
    Path(code): Path<String>,
    Query(query): Query<PromoQuery>,
) -> AppResult<Json<PromoResponse>> {
    let plan_price = plan_price(&pool, query.plan_id).await?;
    let promo = sqlx::query_as::<_, super::models::PromoCode>(
        "SELECT * FROM promo_codes WHERE tenant_id = $1 AND code = $2",
    )
    .bind(query.tenant_id)
    .bind(&code)
    .fetch_optional(&pool)
    .await?;

    let Some(promo) = promo else {
        return Ok(Json(PromoResponse {
            valid: false,
            discount_cents: 0,
            reason: Some("unknown-code".to_string()),
        }));
    };

    let outcome = pricing::validate_promo(&promo, query.plan_id, plan_price, Utc::now().date_naive());
    Ok(Json(PromoResponse {
        valid: outcome.valid,
        discount_cents: outcome.discount_cents,
        reason: outcome.reason.map(str::to_string),
    }))
}

/// Redemption re-validates against a fresh row and increments under the cap
/// guard, so the enrollment flow can call this directly.
pub async fn redeem_promo_code(
    Extension(pool): Extension<PgPool>,
    Path(code): Path<String>,
    Query(query): Query<PromoQuery>,
) -> AppResult<Json<PromoResponse>> {
    let plan_price = plan_price(&pool, query.plan_id).await?;
    let ledger = InvoiceLedger::new(pool);
    let redeemed = ledger
        .redeem_promo(
            query.tenant_id,
            &code,
            query.plan_id,
            plan_price,
            Utc::now().date_naive(),
        )
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;

    match redeemed {
        super::ledger::PromoRedemption::Redeemed(promo) => Ok(Json(PromoResponse {
            valid: true,
            discount_cents: pricing::promo_discount(&promo, plan_price),
            reason: None,
        })),
        super::ledger::PromoRedemption::Invalid(reason) => Ok(Json(PromoResponse {
            valid: false,
            discount_cents: 0,
            reason: Some(reason.to_string()),
        })),
    }
}

async fn plan_price(pool: &PgPool, plan_id: Uuid) -> AppResult<i64> {
    let price: Option<i64> = sqlx::query_scalar("SELECT price_cents FROM plans WHERE id = $1")
        .bind(plan_id)
        .fetch_optional(pool)
        .await?;
    price.ok_or(AppError::NotFound)
}

async fn notify_member(pool: &PgPool, notify: &NotifyHandle, event_key: &str, invoice: &Invoice) {
    let email: Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT customer_email FROM subscriptions WHERE id = $1")
            .bind(invoice.subscription_id)
            .fetch_optional(pool)
            .await;
    if let Ok(Some(email)) = email {
        notify.dispatch(
            event_key,
            &email,
            serde_json::json!({
                "invoice_id": invoice.id,
                "amount_cents": invoice.amount_cents,
            }),
        );
    }
}
