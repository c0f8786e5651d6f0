use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> plans,subscriptions,invoices,settlements

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "suspended" => Some(SubscriptionStatus::Suspended),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    PastDue,
    Paid,
    Void,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::PastDue => "past_due",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(InvoiceStatus::Pending),
            "past_due" => Some(InvoiceStatus::PastDue),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            "failed" => Some(InvoiceStatus::Failed),
            _ => None,
        }
    }

    /// PAID and VOID are terminal; everything else can still move.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Void)
    }
}

/// Billing cycle unit carried on a plan. Immutable during a billing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Semiannual,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Daily => "daily",
            BillingCycle::Weekly => "weekly",
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::Semiannual => "semiannual",
            BillingCycle::Annual => "annual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(BillingCycle::Daily),
            "weekly" => Some(BillingCycle::Weekly),
            "monthly" => Some(BillingCycle::Monthly),
            "quarterly" => Some(BillingCycle::Quarterly),
            "semiannual" => Some(BillingCycle::Semiannual),
            "annual" | "yearly" => Some(BillingCycle::Annual),
            _ => None,
        }
    }

    /// First day of the period after one starting at `start`.
    pub fn advance(&self, start: NaiveDate) -> NaiveDate {
        match self {
            BillingCycle::Daily => start + chrono::Duration::days(1),
            BillingCycle::Weekly => start + chrono::Duration::days(7),
            BillingCycle::Monthly => start
                .checked_add_months(chrono::Months::new(1))
                .unwrap_or(start),
            BillingCycle::Quarterly => start
                .checked_add_months(chrono::Months::new(3))
                .unwrap_or(start),
            BillingCycle::Semiannual => start
                .checked_add_months(chrono::Months::new(6))
                .unwrap_or(start),
            BillingCycle::Annual => start
                .checked_add_months(chrono::Months::new(12))
                .unwrap_or(start),
        }
    }

    /// Last day covered by a period starting at `start` (inclusive).
    pub fn period_end(&self, start: NaiveDate) -> NaiveDate {
        self.advance(start) - chrono::Duration::days(1)
    }
}

/// key: billing-subscription-model -> one member's recurring obligation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub status: String,
    pub started_at: NaiveDate,
    pub next_charge_date: NaiveDate,
    pub price_override_cents: Option<i64>,
    pub first_period_discount_only: bool,
    pub retry_count: i32,
    pub next_retry_date: Option<NaiveDate>,
    pub last_payment_date: Option<NaiveDate>,
    pub family_group_id: Option<Uuid>,
    pub processor: Option<String>,
    pub processor_customer_ref: Option<String>,
    pub credit_balance: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub billing_cycle: String,
    pub auto_renew: bool,
    pub family_discount_percent: i32,
    pub rank_discount_percent: i32,
    pub period_credits: i32,
    pub cancellation_terms: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn cycle(&self) -> BillingCycle {
        BillingCycle::parse(&self.billing_cycle).unwrap_or(BillingCycle::Monthly)
    }
}

/// key: billing-invoice-model -> the core ledger row
///
/// (subscription_id, billing_period_start) is unique; `amount_cents` never
/// changes after creation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_period_start: NaiveDate,
    pub billing_period_end: NaiveDate,
    pub due_date: NaiveDate,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub settlement_transaction_id: Option<Uuid>,
    pub checkout_session_id: Option<String>,
    pub checkout_processor: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> Option<InvoiceStatus> {
        InvoiceStatus::parse(&self.status)
    }
}

/// Records money actually moving; one row per capture or refund.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettlementTransaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub processor: String,
    pub external_payment_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

pub const SETTLEMENT_KIND_PAYMENT: &str = "payment";
pub const SETTLEMENT_KIND_REFUND: &str = "refund";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub discount_type: String,
    pub discount_value: i64,
    pub valid_from: NaiveDate,
    pub valid_until: NaiveDate,
    pub max_redemptions: i32,
    pub redemption_count: i32,
    pub applicable_plan_ids: Vec<Uuid>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

pub const PROMO_DISCOUNT_PERCENT: &str = "percent";
pub const PROMO_DISCOUNT_FIXED: &str = "fixed";
