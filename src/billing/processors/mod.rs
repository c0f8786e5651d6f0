pub mod finchpay;
pub mod northpay;
pub mod orbipay;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::settings::TenantBillingSettings;

pub use finchpay::FinchPayAdapter;
pub use northpay::NorthPayAdapter;
pub use orbipay::OrbiPayAdapter;

/// key: billing-processors -> uniform surface over three capture models
///
/// NorthPay captures in a single phase, OrbiPay needs an explicit capture
/// after customer approval, FinchPay reports completion against a
/// caller-supplied reference id. None of that leaks past this module.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Processor {
    NorthPay,
    OrbiPay,
    FinchPay,
}

impl Processor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::NorthPay => "northpay",
            Processor::OrbiPay => "orbipay",
            Processor::FinchPay => "finchpay",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "northpay" => Some(Processor::NorthPay),
            "orbipay" => Some(Processor::OrbiPay),
            "finchpay" => Some(Processor::FinchPay),
            _ => None,
        }
    }
}

/// Canonical event shape decoded from provider payloads at the webhook
/// boundary. Provider-specific JSON never travels further than this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    Succeeded {
        external_payment_id: String,
        amount_cents: i64,
        currency: String,
        metadata: HashMap<String, String>,
    },
    Failed {
        external_payment_id: String,
        reason: String,
        metadata: HashMap<String, String>,
    },
    Refunded {
        external_payment_id: String,
        amount_cents: i64,
        metadata: HashMap<String, String>,
    },
    Ignored {
        kind: String,
    },
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub checkout_url: String,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct OffSessionCharge {
    pub external_payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Complete {
        external_payment_id: String,
        metadata: HashMap<String, String>,
    },
    Expired,
    Failed,
}

/// Raised when an inbound webhook fails signature verification. Maps to a
/// hard 400 with no ledger mutation.
#[derive(Debug, Error)]
#[error("webhook signature rejected: {0}")]
pub struct SignatureError(pub &'static str);

#[async_trait]
pub trait ProcessorAdapter: Send + Sync {
    fn processor(&self) -> Processor;

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession>;

    /// Charges a stored customer without user interaction, for auto-billing.
    async fn charge_off_session(
        &self,
        customer_ref: &str,
        amount_cents: i64,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<OffSessionCharge>;

    /// Idempotent: repeated polls of a completed session return the same
    /// outcome. For OrbiPay this is where an approved order gets captured.
    async fn poll_status(&self, session_id: &str) -> Result<PollOutcome>;

    async fn refund(&self, external_payment_id: &str, amount_cents: i64, currency: &str)
        -> Result<()>;

    /// Verifies the provider signature over the raw request body. Must run
    /// before any parsing of the payload.
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError>;

    /// Decodes a verified payload into the canonical event shape. Async
    /// because OrbiPay approval events trigger the capture call here.
    async fn normalize_webhook(&self, body: &[u8]) -> Result<ProcessorEvent>;
}

/// key: billing-processor-registry -> explicit per-tenant adapter factory
///
/// Built from one tenant's stored credentials and handed to the scheduler,
/// reconciler and API layer. There is no process-wide client cache; a
/// credential rotation takes effect on the next construction.
pub struct ProcessorRegistry {
    adapters: HashMap<Processor, Arc<dyn ProcessorAdapter>>,
}

impl ProcessorRegistry {
    pub fn from_settings(settings: &TenantBillingSettings) -> Self {
        let mut adapters: HashMap<Processor, Arc<dyn ProcessorAdapter>> = HashMap::new();

        if let Some(adapter) = NorthPayAdapter::from_settings(settings) {
            adapters.insert(Processor::NorthPay, Arc::new(adapter));
        }
        if let Some(adapter) = OrbiPayAdapter::from_settings(settings) {
            adapters.insert(Processor::OrbiPay, Arc::new(adapter));
        }
        if let Some(adapter) = FinchPayAdapter::from_settings(settings) {
            adapters.insert(Processor::FinchPay, Arc::new(adapter));
        }

        Self { adapters }
    }

    pub fn adapter(&self, processor: Processor) -> Option<Arc<dyn ProcessorAdapter>> {
        self.adapters.get(&processor).cloned()
    }

    pub fn configured(&self) -> impl Iterator<Item = Processor> + '_ {
        self.adapters.keys().copied()
    }
}

pub(crate) fn hmac_sha256(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can use any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-shape comparison; both sides are fixed-length digests so a plain
/// byte compare over equal lengths is sufficient here.
pub(crate) fn digests_match(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Extracts a flat string map from a JSON object, dropping non-string values.
pub(crate) fn metadata_map(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(serde_json::Value::Object(entries)) = value {
        for (key, entry) in entries {
            if let serde_json::Value::String(text) = entry {
                map.insert(key.clone(), text.clone());
            }
        }
    }
    map
}

/// OrbiPay reports money as decimal strings ("104.50"); everything internal
/// is integer cents.
pub(crate) fn cents_from_decimal(value: &str) -> Option<i64> {
    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (value, ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        2 => frac.parse().ok()?,
        _ => return None,
    };
    if whole < 0 || value.starts_with('-') {
        return None;
    }
    Some(whole * 100 + frac_cents)
}

pub(crate) fn decimal_from_cents(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_round_trip() {
        assert_eq!(cents_from_decimal("104.50"), Some(10450));
        assert_eq!(cents_from_decimal("104.5"), Some(10450));
        assert_eq!(cents_from_decimal("104"), Some(10400));
        assert_eq!(cents_from_decimal("0.07"), Some(7));
        assert_eq!(decimal_from_cents(10450), "104.50");
        assert_eq!(decimal_from_cents(7), "0.07");
    }

    #[test]
    fn decimal_rejects_junk() {
        assert_eq!(cents_from_decimal("-1.00"), None);
        assert_eq!(cents_from_decimal("10.001"), None);
        assert_eq!(cents_from_decimal("abc"), None);
    }

    #[test]
    fn digest_comparison() {
        assert!(digests_match(b"abcd", b"abcd"));
        assert!(!digests_match(b"abcd", b"abce"));
        assert!(!digests_match(b"abcd", b"abc"));
    }

    #[test]
    fn metadata_map_keeps_only_strings() {
        let value = serde_json::json!({"invoice_id": "inv-1", "attempt": 2});
        let map = metadata_map(Some(&value));
        assert_eq!(map.get("invoice_id").map(String::as_str), Some("inv-1"));
        assert!(!map.contains_key("attempt"));
    }
}
