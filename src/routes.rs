use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::{billing::api, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/run", post(api::run_billing))
        .route("/api/invoices", get(api::list_invoices))
        .route("/api/invoices/:id", patch(api::patch_invoice))
        .route(
            "/api/invoices/:id/checkout",
            post(api::create_invoice_checkout),
        )
        .route("/api/checkout/status", get(api::checkout_status))
        .route(
            "/api/subscriptions/:id/reactivate",
            post(api::reactivate_subscription),
        )
        .route("/api/promos/:code/validate", get(api::validate_promo_code))
        .route("/api/promos/:code/redeem", post(api::redeem_promo_code))
        .route(
            "/api/webhooks/northpay/:tenant_id",
            post(webhooks::northpay_webhook),
        )
        .route(
            "/api/webhooks/orbipay/:tenant_id",
            post(webhooks::orbipay_webhook),
        )
        .route(
            "/api/webhooks/finchpay/:tenant_id",
            post(webhooks::finchpay_webhook),
        )
}
