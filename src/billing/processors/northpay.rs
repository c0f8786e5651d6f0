use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use crate::config;
use crate::settings::TenantBillingSettings;

use super::{
    digests_match, hmac_sha256, metadata_map, CheckoutRequest, CheckoutSession, OffSessionCharge,
    PollOutcome, Processor, ProcessorAdapter, ProcessorEvent, SignatureError,
};

/// key: billing-processor-northpay -> single-phase card capture
///
/// Checkout sessions capture in one step; completion is observed by webhook
/// or by polling the session. Webhooks are signed
/// `t=<unix>,v1=<hex hmac-sha256 of "t.body">`.
pub struct NorthPayAdapter {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
    webhook_secret: String,
}

const SIGNATURE_HEADER: &str = "northpay-signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

impl NorthPayAdapter {
    pub fn new(api_base: String, secret_key: String, webhook_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            secret_key,
            webhook_secret,
        }
    }

    pub fn from_settings(settings: &TenantBillingSettings) -> Option<Self> {
        let secret_key = settings.northpay_secret_key.clone()?;
        let webhook_secret = settings.northpay_webhook_secret.clone()?;
        Some(Self::new(
            config::NORTHPAY_API_BASE.clone(),
            secret_key,
            webhook_secret,
        ))
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("northpay {path} returned {status}: {detail}"));
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
    status: Option<String>,
    payment_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    kind: String,
    data: WebhookPayment,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    id: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    failure_reason: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[async_trait]
impl ProcessorAdapter for NorthPayAdapter {
    fn processor(&self) -> Processor {
        Processor::NorthPay
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let body = serde_json::json!({
            "amount": request.amount_cents,
            "currency": request.currency,
            "success_url": request.success_url,
            "cancel_url": request.cancel_url,
            "metadata": request.metadata,
        });
        let session: SessionResponse = self.post_json("/v1/checkout/sessions", &body).await?;
        let checkout_url = session
            .url
            .ok_or_else(|| anyhow!("northpay session {} missing checkout url", session.id))?;
        Ok(CheckoutSession {
            checkout_url,
            session_id: session.id,
        })
    }

    async fn charge_off_session(
        &self,
        customer_ref: &str,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<OffSessionCharge> {
        let body = serde_json::json!({
            "customer": customer_ref,
            "amount": amount_cents,
            "currency": currency,
            "off_session": true,
            "metadata": metadata,
        });
        let charge: ChargeResponse = self.post_json("/v1/charges", &body).await?;
        if charge.status != "succeeded" {
            return Err(anyhow!(
                "northpay charge {} declined: {}",
                charge.id,
                charge.failure_reason.unwrap_or_else(|| charge.status.clone())
            ));
        }
        Ok(OffSessionCharge {
            external_payment_id: charge.id,
        })
    }

    async fn poll_status(&self, session_id: &str) -> Result<PollOutcome> {
        let response = self
            .client
            .get(format!(
                "{}/v1/checkout/sessions/{}",
                self.api_base, session_id
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("northpay session fetch returned {status}: {detail}"));
        }
        let session: SessionResponse = response.json().await?;
        match session.status.as_deref() {
            Some("complete") => {
                let external_payment_id = session.payment_id.ok_or_else(|| {
                    anyhow!("northpay session {} complete without payment id", session.id)
                })?;
                Ok(PollOutcome::Complete {
                    external_payment_id,
                    metadata: metadata_map(Some(&session.metadata)),
                })
            }
            Some("expired") => Ok(PollOutcome::Expired),
            Some("failed") => Ok(PollOutcome::Failed),
            _ => Ok(PollOutcome::Pending),
        }
    }

    async fn refund(
        &self,
        external_payment_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<()> {
        let body = serde_json::json!({
            "payment": external_payment_id,
            "amount": amount_cents,
            "currency": currency,
        });
        let refund: RefundResponse = self.post_json("/v1/refunds", &body).await?;
        if refund.status != "succeeded" {
            return Err(anyhow!(
                "northpay refund for {external_payment_id} returned status {}",
                refund.status
            ));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(SignatureError("missing signature header"))?;

        let mut timestamp: Option<i64> = None;
        let mut provided: Option<String> = None;
        for part in header.split(',') {
            match part.split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => provided = Some(value.to_string()),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(SignatureError("missing timestamp"))?;
        let provided = provided.ok_or(SignatureError("missing v1 signature"))?;

        if (Utc::now().timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(SignatureError("timestamp outside tolerance"));
        }

        let mut signed = timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(body);
        let expected = hex::encode(hmac_sha256(self.webhook_secret.as_bytes(), &signed));
        if !digests_match(expected.as_bytes(), provided.as_bytes()) {
            return Err(SignatureError("signature mismatch"));
        }
        Ok(())
    }

    async fn normalize_webhook(&self, body: &[u8]) -> Result<ProcessorEvent> {
        let envelope: WebhookEnvelope = serde_json::from_slice(body)?;
        let metadata = metadata_map(Some(&envelope.data.metadata));
        let event = match envelope.kind.as_str() {
            "payment.succeeded" => ProcessorEvent::Succeeded {
                external_payment_id: envelope.data.id,
                amount_cents: envelope.data.amount,
                currency: envelope.data.currency,
                metadata,
            },
            "payment.failed" => ProcessorEvent::Failed {
                external_payment_id: envelope.data.id,
                reason: envelope
                    .data
                    .failure_reason
                    .unwrap_or_else(|| "declined".to_string()),
                metadata,
            },
            "payment.refunded" => ProcessorEvent::Refunded {
                external_payment_id: envelope.data.id,
                amount_cents: envelope.data.amount,
                metadata,
            },
            other => ProcessorEvent::Ignored {
                kind: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// Mirror of the provider's signing step; used by test fixtures and by
/// operators replaying captured deliveries.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(body);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(hmac_sha256(secret.as_bytes(), &signed))
    )
}
