use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::billing::processors::{Processor, ProcessorRegistry};
use crate::billing::reconciler::{ReconcileOutcome, Reconciler};
use crate::notify::NotifyHandle;
use crate::settings::TenantBillingSettings;

/// key: webhooks-processors -> one inbound endpoint per payment provider
///
/// The raw body is verified before any parsing. 200 acknowledges success and
/// idempotent no-ops, 400 rejects bad signatures and payloads with no state
/// change, 502 asks the provider to redeliver a transiently unresolvable
/// event.
pub async fn northpay_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(notify): Extension<NotifyHandle>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    handle(pool, notify, tenant_id, Processor::NorthPay, headers, body).await
}

pub async fn orbipay_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(notify): Extension<NotifyHandle>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    handle(pool, notify, tenant_id, Processor::OrbiPay, headers, body).await
}

pub async fn finchpay_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(notify): Extension<NotifyHandle>,
    Path(tenant_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    handle(pool, notify, tenant_id, Processor::FinchPay, headers, body).await
}

async fn handle(
    pool: PgPool,
    notify: NotifyHandle,
    tenant_id: Uuid,
    processor: Processor,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let settings = match TenantBillingSettings::load(&pool, tenant_id).await {
        Ok(settings) => settings,
        Err(err) => {
            warn!(?err, %tenant_id, "failed to load tenant settings for webhook");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let registry = ProcessorRegistry::from_settings(&settings);
    let Some(adapter) = registry.adapter(processor) else {
        warn!(
            %tenant_id,
            processor = processor.as_str(),
            "webhook for a processor the tenant has not configured"
        );
        return StatusCode::BAD_REQUEST;
    };

    if let Err(err) = adapter.verify_webhook(&headers, &body) {
        warn!(
            %tenant_id,
            processor = processor.as_str(),
            %err,
            "webhook signature verification failed"
        );
        return StatusCode::BAD_REQUEST;
    }

    let event = match adapter.normalize_webhook(&body).await {
        Ok(event) => event,
        Err(err) => {
            warn!(?err, %tenant_id, processor = processor.as_str(), "webhook payload rejected");
            return StatusCode::BAD_REQUEST;
        }
    };

    let reconciler = Reconciler::new(pool, notify);
    match reconciler.apply(tenant_id, processor, &settings, event).await {
        Ok(ReconcileOutcome::Applied)
        | Ok(ReconcileOutcome::Duplicate)
        | Ok(ReconcileOutcome::Ignored) => StatusCode::OK,
        Ok(ReconcileOutcome::Deferred) => StatusCode::BAD_GATEWAY,
        Err(err) => {
            warn!(?err, %tenant_id, "webhook reconciliation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
