use axum::{
    routing::{get, post},
    Router,
};

use crate::{analytics, billing, connect, webhooks};

pub async fn root() -> &'static str {
    "Marketplace Billing API"
}

/// Root banner, `/metrics` and the API. `render_metrics` produces the Prometheus text body.
pub fn app_routes<F>(render_metrics: F) -> Router
where
    F: Fn() -> String + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || {
                let render = render_metrics.clone();
                async move { render() }
            }),
        )
        .merge(api_routes())
}

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/billing/subscription",
            get(billing::api::get_subscription).put(billing::api::sync_subscription),
        )
        .route(
            "/api/billing/subscription/status",
            post(billing::api::update_status),
        )
        .route("/api/billing/usage/reset", post(billing::api::reset_usage))
        .route("/api/billing/access", post(billing::api::check_access))
        .route("/api/billing/usage", post(billing::api::track_usage))
        .route("/api/billing/usage/stats", get(billing::api::usage_stats))
        .route("/api/billing/checkout", post(billing::api::create_checkout))
        .route("/api/billing/portal", post(billing::api::open_portal))
        .route("/api/billing/cancel", post(billing::api::cancel_subscription))
        .route("/api/billing/provider", get(billing::api::provider_info))
        .route(
            "/api/connect/account",
            get(connect::api::get_account).post(connect::api::create_account),
        )
        .route("/api/connect/account/sync", post(connect::api::sync_account))
        .route(
            "/api/connect/account/onboarding-link",
            post(connect::api::onboarding_link),
        )
        .route(
            "/api/connect/products",
            get(connect::api::list_products).post(connect::api::create_product),
        )
        .route(
            "/api/connect/products/:id/deactivate",
            post(connect::api::deactivate_product),
        )
        .route("/api/connect/checkout", post(connect::api::create_checkout))
        .route("/api/connect/payments", get(connect::api::list_payments))
        .route("/api/analytics/revenue", get(analytics::revenue_report))
        .route("/api/webhooks/billing", post(webhooks::billing_webhook))
}
