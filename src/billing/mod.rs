pub mod api;
pub mod dunning;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod processors;
pub mod reconciler;
pub mod scheduler;

pub use ledger::{CreateOutcome, InvoiceLedger, NewInvoice, PaidOutcome, SettlementInput, VoidOutcome};
pub use models::{
    BillingCycle, Invoice, InvoiceStatus, Plan, PromoCode, SettlementTransaction, Subscription,
    SubscriptionStatus,
};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use scheduler::{run_billing_cycle, spawn as spawn_billing_scheduler, BillingRunOutcome};
