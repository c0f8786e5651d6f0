use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::config;
use crate::settings::TenantBillingSettings;

use super::{
    cents_from_decimal, decimal_from_cents, digests_match, hmac_sha256, CheckoutRequest,
    CheckoutSession, OffSessionCharge, PollOutcome, Processor, ProcessorAdapter, ProcessorEvent,
    SignatureError,
};

/// key: billing-processor-orbipay -> two-phase approve-then-capture
///
/// A checkout creates an order the customer approves; money only moves after
/// an explicit capture call. Approval shows up as an `order.approved` webhook
/// or as an `APPROVED` poll state, and both paths capture here so callers
/// never see the intermediate phase.
pub struct OrbiPayAdapter {
    client: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    webhook_secret: String,
}

const SIGNATURE_HEADER: &str = "orbipay-transmission-sig";

impl OrbiPayAdapter {
    pub fn new(
        api_base: String,
        client_id: String,
        client_secret: String,
        webhook_secret: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            client_id,
            client_secret,
            webhook_secret,
        }
    }

    pub fn from_settings(settings: &TenantBillingSettings) -> Option<Self> {
        let client_id = settings.orbipay_client_id.clone()?;
        let client_secret = settings.orbipay_client_secret.clone()?;
        let webhook_secret = settings.orbipay_webhook_secret.clone()?;
        Some(Self::new(
            config::ORBIPAY_API_BASE.clone(),
            client_id,
            client_secret,
            webhook_secret,
        ))
    }

    /// Client-credentials token, fetched per operation. Token reuse across
    /// calls is the provider SDK's trick; this client stays stateless.
    async fn access_token(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("orbipay token endpoint returned {status}"));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn fetch_order(&self, token: &str, order_id: &str) -> Result<OrderResponse> {
        let response = self
            .client
            .get(format!("{}/v2/checkout/orders/{}", self.api_base, order_id))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("orbipay order fetch returned {status}: {detail}"));
        }
        Ok(response.json().await?)
    }

    /// Finalizes an approved order. Capturing an order a second time is
    /// reported as already-captured by the provider; that case is resolved by
    /// re-reading the order so repeated polls stay idempotent.
    async fn capture_order(&self, token: &str, order_id: &str) -> Result<OrderResponse> {
        let response = self
            .client
            .post(format!(
                "{}/v2/checkout/orders/{}/capture",
                self.api_base, order_id
            ))
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return self.fetch_order(token, order_id).await;
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("orbipay capture returned {status}: {detail}"));
        }
        Ok(response.json().await?)
    }

    fn completed_outcome(order: &OrderResponse) -> Result<PollOutcome> {
        let capture = order
            .first_capture()
            .ok_or_else(|| anyhow!("orbipay order {} completed without capture", order.id))?;
        let mut metadata = HashMap::new();
        if let Some(custom_id) = order.custom_id() {
            metadata.insert("invoice_id".to_string(), custom_id.to_string());
        }
        Ok(PollOutcome::Complete {
            external_payment_id: capture.id.clone(),
            metadata,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<OrderLink>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct OrderLink {
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    payments: Option<UnitPayments>,
}

#[derive(Debug, Deserialize)]
struct UnitPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
}

impl OrderResponse {
    fn first_capture(&self) -> Option<&Capture> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next()
    }

    fn custom_id(&self) -> Option<&str> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.custom_id.as_deref())
            .next()
    }

    fn approve_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == "approve")
            .map(|link| link.href.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event_type: String,
    resource: WebhookResource,
}

#[derive(Debug, Deserialize)]
struct WebhookResource {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    amount: Option<ResourceAmount>,
    #[serde(default)]
    capture_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceAmount {
    value: String,
    currency_code: String,
}

fn resource_metadata(resource: &WebhookResource) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(custom_id) = &resource.custom_id {
        metadata.insert("invoice_id".to_string(), custom_id.clone());
    }
    metadata
}

#[async_trait]
impl ProcessorAdapter for OrbiPayAdapter {
    fn processor(&self) -> Processor {
        Processor::OrbiPay
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "custom_id": request.metadata.get("invoice_id"),
                "amount": {
                    "currency_code": request.currency.to_uppercase(),
                    "value": decimal_from_cents(request.amount_cents),
                },
            }],
            "application_context": {
                "return_url": request.success_url,
                "cancel_url": request.cancel_url,
            },
        });
        let response = self
            .client
            .post(format!("{}/v2/checkout/orders", self.api_base))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("orbipay order create returned {status}: {detail}"));
        }
        let order: OrderResponse = response.json().await?;
        let checkout_url = order
            .approve_link()
            .ok_or_else(|| anyhow!("orbipay order {} missing approve link", order.id))?
            .to_string();
        Ok(CheckoutSession {
            checkout_url,
            session_id: order.id,
        })
    }

    async fn charge_off_session(
        &self,
        customer_ref: &str,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<OffSessionCharge> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "payment_source": {
                "token": { "id": customer_ref, "type": "BILLING_AGREEMENT" },
            },
            "purchase_units": [{
                "custom_id": metadata.get("invoice_id"),
                "amount": {
                    "currency_code": currency.to_uppercase(),
                    "value": decimal_from_cents(amount_cents),
                },
            }],
        });
        let response = self
            .client
            .post(format!("{}/v2/checkout/orders", self.api_base))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("orbipay off-session order returned {status}: {detail}"));
        }
        let mut order: OrderResponse = response.json().await?;
        // vaulted orders normally complete in one round trip; capture if not
        if order.status != "COMPLETED" {
            order = self.capture_order(&token, &order.id).await?;
        }
        let capture = order
            .first_capture()
            .ok_or_else(|| anyhow!("orbipay order {} has no capture", order.id))?;
        Ok(OffSessionCharge {
            external_payment_id: capture.id.clone(),
        })
    }

    async fn poll_status(&self, session_id: &str) -> Result<PollOutcome> {
        let token = self.access_token().await?;
        let order = self.fetch_order(&token, session_id).await?;
        match order.status.as_str() {
            "CREATED" | "PAYER_ACTION_REQUIRED" => Ok(PollOutcome::Pending),
            "APPROVED" => {
                let captured = self.capture_order(&token, session_id).await?;
                Self::completed_outcome(&captured)
            }
            "COMPLETED" => Self::completed_outcome(&order),
            "VOIDED" | "EXPIRED" => Ok(PollOutcome::Expired),
            "DECLINED" => Ok(PollOutcome::Failed),
            other => Err(anyhow!("orbipay order {} in unknown state {other}", order.id)),
        }
    }

    async fn refund(
        &self,
        external_payment_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<()> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "amount": {
                "currency_code": currency.to_uppercase(),
                "value": decimal_from_cents(amount_cents),
            },
        });
        let response = self
            .client
            .post(format!(
                "{}/v2/payments/captures/{}/refund",
                self.api_base, external_payment_id
            ))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("orbipay refund returned {status}: {detail}"));
        }
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(SignatureError("missing signature header"))?;
        let expected = hex::encode(hmac_sha256(self.webhook_secret.as_bytes(), body));
        if !digests_match(expected.as_bytes(), provided.as_bytes()) {
            return Err(SignatureError("signature mismatch"));
        }
        Ok(())
    }

    async fn normalize_webhook(&self, body: &[u8]) -> Result<ProcessorEvent> {
        let envelope: WebhookEnvelope = serde_json::from_slice(body)?;
        let event = match envelope.event_type.as_str() {
            // approval is not money movement; capture now and report the
            // capture as the settled payment
            "order.approved" => {
                let token = self.access_token().await?;
                let order = self.capture_order(&token, &envelope.resource.id).await?;
                match Self::completed_outcome(&order)? {
                    PollOutcome::Complete {
                        external_payment_id,
                        metadata,
                    } => {
                        let amount = envelope
                            .resource
                            .amount
                            .as_ref()
                            .and_then(|amount| cents_from_decimal(&amount.value))
                            .unwrap_or_default();
                        let currency = envelope
                            .resource
                            .amount
                            .map(|amount| amount.currency_code.to_lowercase())
                            .unwrap_or_default();
                        ProcessorEvent::Succeeded {
                            external_payment_id,
                            amount_cents: amount,
                            currency,
                            metadata,
                        }
                    }
                    _ => ProcessorEvent::Ignored {
                        kind: "order.approved".to_string(),
                    },
                }
            }
            "payment.capture.completed" => {
                let amount = envelope.resource.amount.as_ref();
                ProcessorEvent::Succeeded {
                    external_payment_id: envelope.resource.id.clone(),
                    amount_cents: amount
                        .and_then(|amount| cents_from_decimal(&amount.value))
                        .ok_or_else(|| anyhow!("orbipay capture event missing amount"))?,
                    currency: amount
                        .map(|amount| amount.currency_code.to_lowercase())
                        .unwrap_or_default(),
                    metadata: resource_metadata(&envelope.resource),
                }
            }
            "payment.capture.denied" => ProcessorEvent::Failed {
                external_payment_id: envelope.resource.id.clone(),
                reason: envelope
                    .resource
                    .reason
                    .clone()
                    .or(envelope.resource.status.clone())
                    .unwrap_or_else(|| "denied".to_string()),
                metadata: resource_metadata(&envelope.resource),
            },
            "payment.capture.refunded" => {
                // resource is the refund; capture_id points back at the payment
                let external_payment_id = envelope
                    .resource
                    .capture_id
                    .clone()
                    .unwrap_or_else(|| envelope.resource.id.clone());
                ProcessorEvent::Refunded {
                    external_payment_id,
                    amount_cents: envelope
                        .resource
                        .amount
                        .as_ref()
                        .and_then(|amount| cents_from_decimal(&amount.value))
                        .unwrap_or_default(),
                    metadata: resource_metadata(&envelope.resource),
                }
            }
            other => ProcessorEvent::Ignored {
                kind: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// Mirror of the provider's signing step for fixtures and replay tooling.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    hex::encode(hmac_sha256(secret.as_bytes(), body))
}
