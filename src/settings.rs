use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::config;

/// key: billing-settings -> per-tenant billing knobs and processor credentials
///
/// Tenants without a stored row fall back to the environment defaults with no
/// processors configured; checkout and off-session charging stay disabled for
/// them until credentials are saved.
#[derive(Debug, Clone, FromRow)]
pub struct TenantBillingSettings {
    pub tenant_id: Uuid,
    pub grace_period_days: i32,
    pub max_retries: i32,
    pub currency: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub northpay_secret_key: Option<String>,
    pub northpay_webhook_secret: Option<String>,
    pub orbipay_client_id: Option<String>,
    pub orbipay_client_secret: Option<String>,
    pub orbipay_webhook_secret: Option<String>,
    pub finchpay_access_token: Option<String>,
    pub finchpay_signature_key: Option<String>,
    pub finchpay_notification_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TenantBillingSettings {
    pub fn defaults(tenant_id: Uuid) -> Self {
        let base = config::PUBLIC_BASE_URL.as_str();
        Self {
            tenant_id,
            grace_period_days: *config::BILLING_GRACE_PERIOD_DAYS,
            max_retries: *config::BILLING_MAX_RETRIES,
            currency: "usd".to_string(),
            checkout_success_url: format!("{base}/checkout/complete"),
            checkout_cancel_url: format!("{base}/checkout/cancelled"),
            northpay_secret_key: None,
            northpay_webhook_secret: None,
            orbipay_client_id: None,
            orbipay_client_secret: None,
            orbipay_webhook_secret: None,
            finchpay_access_token: None,
            finchpay_signature_key: None,
            finchpay_notification_url: None,
            updated_at: Utc::now(),
        }
    }

    pub async fn load(pool: &PgPool, tenant_id: Uuid) -> Result<Self> {
        let row = sqlx::query_as::<_, TenantBillingSettings>(
            "SELECT * FROM tenant_billing_settings WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.unwrap_or_else(|| Self::defaults(tenant_id)))
    }
}
