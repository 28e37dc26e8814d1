use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use marketplace_billing::audit::{AuditSink, PgAuditSink, TracingAuditSink};
use marketplace_billing::billing::{
    spawn_usage_reset_scheduler, start_reconciliation_worker, BillingProviderResolver,
    BillingService, ProviderSettings, Reconciler, ReconciliationJob,
};
use marketplace_billing::config::{self, StoreBackend};
use marketplace_billing::connect::{ConnectGateway, ConnectService, StripeConnectGateway};
use marketplace_billing::routes::app_routes;
use marketplace_billing::store::{BillingStore, MemoryStore, PgStore};
use marketplace_billing::webhooks::WebhookSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let (store, audit): (Arc<dyn BillingStore>, Arc<dyn AuditSink>) = match *config::BILLING_STORE
    {
        StoreBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(config::DATABASE_URL.as_str())
                .await
                .context("failed to connect to billing database")?;

            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(error).context("failed to run billing migrations");
                }
            }
            (
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgAuditSink::new(pool)),
            )
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory billing store; state is lost on restart");
            (Arc::new(MemoryStore::new()), Arc::new(TracingAuditSink))
        }
    };

    let billing = BillingService::new(store.clone(), audit.clone());
    let catalog = Arc::new(config::BILLING_PLAN_CATALOG.clone());
    let provider_settings = ProviderSettings::from_env();
    let resolver = Arc::new(BillingProviderResolver::from_settings(
        &provider_settings,
        billing.clone(),
        catalog.clone(),
    )?);

    let connect_gateway = match provider_settings.stripe.as_ref() {
        Some(creds) => {
            let gateway: Arc<dyn ConnectGateway> = Arc::new(StripeConnectGateway::new(
                creds.api_base.as_deref(),
                &creds.api_key,
            )?);
            Some(gateway)
        }
        None => {
            tracing::warn!("stripe credentials missing; connected accounts disabled");
            None
        }
    };
    let connect = ConnectService::new(
        store.clone(),
        connect_gateway,
        audit.clone(),
        config::CONNECT_SETTINGS.clone(),
    );

    let reconciler = Reconciler::new(billing.clone(), catalog.clone(), resolver.active_kind());
    let reconciliation = start_reconciliation_worker(reconciler.clone());
    // events left unprocessed by a previous run
    if let Err(error) = reconciliation
        .dispatch(ReconciliationJob::ReplayFailed { limit: 100 })
        .await
    {
        tracing::warn!(?error, "failed to schedule startup replay");
    }

    spawn_usage_reset_scheduler(
        billing.clone(),
        catalog.clone(),
        resolver.adapter().ok().cloned(),
    );

    let webhook_settings = WebhookSettings {
        secret: config::BILLING_WEBHOOK_SECRET.clone(),
        tolerance_secs: *config::BILLING_WEBHOOK_TOLERANCE_SECS,
    };
    if webhook_settings.secret.is_none() {
        tracing::warn!("BILLING_WEBHOOK_SECRET is not set; webhook ingress will reject events");
    }

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = app_routes(move || metrics_handle.render())
        .layer(prometheus_layer)
        .layer(Extension(billing))
        .layer(Extension(resolver))
        .layer(Extension(connect))
        .layer(Extension(reconciler))
        .layer(Extension(reconciliation))
        .layer(Extension(webhook_settings));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
