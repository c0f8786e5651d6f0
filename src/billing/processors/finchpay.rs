use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use serde::Deserialize;
use uuid::Uuid;

use crate::config;
use crate::settings::TenantBillingSettings;

use super::{
    digests_match, hmac_sha256, CheckoutRequest, CheckoutSession, OffSessionCharge, PollOutcome,
    Processor, ProcessorAdapter, ProcessorEvent, SignatureError,
};

/// key: billing-processor-finchpay -> reference-id keyed completion
///
/// Checkout links carry a caller-supplied reference id; the status webhook is
/// keyed by that reference rather than by a session id, so the reference
/// doubles as the session handle. Signatures are
/// base64(hmac-sha256(notification_url + body)).
pub struct FinchPayAdapter {
    client: reqwest::Client,
    api_base: String,
    access_token: String,
    signature_key: String,
    notification_url: String,
}

const SIGNATURE_HEADER: &str = "x-finchpay-signature";

impl FinchPayAdapter {
    pub fn new(
        api_base: String,
        access_token: String,
        signature_key: String,
        notification_url: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            access_token,
            signature_key,
            notification_url,
        }
    }

    pub fn from_settings(settings: &TenantBillingSettings) -> Option<Self> {
        let access_token = settings.finchpay_access_token.clone()?;
        let signature_key = settings.finchpay_signature_key.clone()?;
        let notification_url = settings.finchpay_notification_url.clone()?;
        Some(Self::new(
            config::FINCHPAY_API_BASE.clone(),
            access_token,
            signature_key,
            notification_url,
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
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("finchpay {path} returned {status}: {detail}"));
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutLinkResponse {
    link: CheckoutLink,
}

#[derive(Debug, Deserialize)]
struct CheckoutLink {
    url: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutStatusResponse {
    state: String,
    payment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    payment: PaymentBody,
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    refund: RefundBody,
}

#[derive(Debug, Deserialize)]
struct RefundBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    kind: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize, Default)]
struct WebhookObject {
    #[serde(default)]
    payment: Option<WebhookPayment>,
    #[serde(default)]
    refund: Option<WebhookRefund>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    id: String,
    status: String,
    reference_id: Option<String>,
    #[serde(default)]
    amount_cents: i64,
    #[serde(default)]
    currency: String,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookRefund {
    payment_id: String,
    status: String,
    #[serde(default)]
    amount_cents: i64,
    reference_id: Option<String>,
}

fn reference_metadata(reference_id: Option<&str>) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(reference) = reference_id {
        metadata.insert("invoice_id".to_string(), reference.to_string());
    }
    metadata
}

#[async_trait]
impl ProcessorAdapter for FinchPayAdapter {
    fn processor(&self) -> Processor {
        Processor::FinchPay
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        // the reference id is the session handle; completion webhooks and
        // status polls are both keyed by it
        let reference_id = request
            .metadata
            .get("invoice_id")
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let body = serde_json::json!({
            "reference_id": reference_id,
            "amount_cents": request.amount_cents,
            "currency": request.currency.to_uppercase(),
            "redirect_url": request.success_url,
            "cancel_url": request.cancel_url,
        });
        let created: CheckoutLinkResponse = self.post_json("/v2/checkout/links", &body).await?;
        Ok(CheckoutSession {
            checkout_url: created.link.url,
            session_id: reference_id,
        })
    }

    async fn charge_off_session(
        &self,
        customer_ref: &str,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<OffSessionCharge> {
        let reference_id = metadata
            .get("invoice_id")
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let body = serde_json::json!({
            "customer_id": customer_ref,
            "amount_cents": amount_cents,
            "currency": currency.to_uppercase(),
            "reference_id": reference_id,
            "autocomplete": true,
        });
        let charged: PaymentResponse = self.post_json("/v2/payments", &body).await?;
        if charged.payment.status != "COMPLETED" {
            return Err(anyhow!(
                "finchpay payment {} in state {}",
                charged.payment.id,
                charged.payment.status
            ));
        }
        Ok(OffSessionCharge {
            external_payment_id: charged.payment.id,
        })
    }

    async fn poll_status(&self, session_id: &str) -> Result<PollOutcome> {
        let response = self
            .client
            .get(format!("{}/v2/checkout/status", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("reference_id", session_id)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("finchpay status fetch returned {status}: {detail}"));
        }
        let checkout: CheckoutStatusResponse = response.json().await?;
        match checkout.state.as_str() {
            "COMPLETED" => {
                let external_payment_id = checkout.payment_id.ok_or_else(|| {
                    anyhow!("finchpay reported completion without a payment id")
                })?;
                Ok(PollOutcome::Complete {
                    external_payment_id,
                    metadata: reference_metadata(Some(session_id)),
                })
            }
            "EXPIRED" => Ok(PollOutcome::Expired),
            "FAILED" => Ok(PollOutcome::Failed),
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
            "payment_id": external_payment_id,
            "amount_cents": amount_cents,
            "currency": currency.to_uppercase(),
        });
        let refunded: RefundResponse = self.post_json("/v2/refunds", &body).await?;
        if refunded.refund.status != "COMPLETED" && refunded.refund.status != "PENDING" {
            return Err(anyhow!(
                "finchpay refund for {external_payment_id} in state {}",
                refunded.refund.status
            ));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(SignatureError("missing signature header"))?;
        let mut signed = self.notification_url.clone().into_bytes();
        signed.extend_from_slice(body);
        let expected = base64::engine::general_purpose::STANDARD
            .encode(hmac_sha256(self.signature_key.as_bytes(), &signed));
        if !digests_match(expected.as_bytes(), provided.as_bytes()) {
            return Err(SignatureError("signature mismatch"));
        }
        Ok(())
    }

    async fn normalize_webhook(&self, body: &[u8]) -> Result<ProcessorEvent> {
        let envelope: WebhookEnvelope = serde_json::from_slice(body)?;
        let event = match (envelope.kind.as_str(), envelope.data.object) {
            (
                "payment.updated",
                WebhookObject {
                    payment: Some(payment),
                    ..
                },
            ) => match payment.status.as_str() {
                "COMPLETED" => ProcessorEvent::Succeeded {
                    external_payment_id: payment.id,
                    amount_cents: payment.amount_cents,
                    currency: payment.currency.to_lowercase(),
                    metadata: reference_metadata(payment.reference_id.as_deref()),
                },
                "FAILED" => ProcessorEvent::Failed {
                    external_payment_id: payment.id,
                    reason: payment
                        .failure_reason
                        .unwrap_or_else(|| "declined".to_string()),
                    metadata: reference_metadata(payment.reference_id.as_deref()),
                },
                // APPROVED / PENDING interim states carry no ledger meaning
                other => ProcessorEvent::Ignored {
                    kind: format!("payment.updated:{other}"),
                },
            },
            (
                "refund.updated",
                WebhookObject {
                    refund: Some(refund),
                    ..
                },
            ) if refund.status == "COMPLETED" => ProcessorEvent::Refunded {
                external_payment_id: refund.payment_id,
                amount_cents: refund.amount_cents,
                metadata: reference_metadata(refund.reference_id.as_deref()),
            },
            (kind, _) => ProcessorEvent::Ignored {
                kind: kind.to_string(),
            },
        };
        Ok(event)
    }
}

/// Mirror of the provider's signing step for fixtures and replay tooling.
pub fn sign_payload(signature_key: &str, notification_url: &str, body: &[u8]) -> String {
    let mut signed = notification_url.as_bytes().to_vec();
    signed.extend_from_slice(body);
    base64::engine::general_purpose::STANDARD.encode(hmac_sha256(signature_key.as_bytes(), &signed))
}
