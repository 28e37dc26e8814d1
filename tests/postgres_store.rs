use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;

use marketplace_billing::audit::PgAuditSink;
use marketplace_billing::billing::models::RecordOutcome;
use marketplace_billing::billing::{
    BillingService, PlanCatalog, PlanType, ProcessorEnvelope, ReconcileOutcome, Reconciler,
    SubscriptionAttrs, SubscriptionStatus, UsageOptions,
};
use marketplace_billing::store::PgStore;

fn service(pool: &PgPool) -> BillingService {
    BillingService::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(PgAuditSink::new(pool.clone())),
    )
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn postgres_usage_counter_matches_ledger(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let billing = service(&pool);

    let attrs = SubscriptionAttrs::new("pro", PlanType::Paid, SubscriptionStatus::Active)
        .with_feature("ai_requests", Some(10));
    let subscription = billing
        .create_or_sync_subscription("pg-owner-1", &attrs, "test")
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let billing = billing.clone();
        handles.push(tokio::spawn(async move {
            billing
                .track_usage("pg-owner-1", "ai_requests", 1, UsageOptions::default(), "test")
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let current = billing.require_subscription("pg-owner-1").await.unwrap();
    assert_eq!(current.usage_for("ai_requests"), 8);

    let ledger: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM billing_usage_log WHERE subscription_id = $1 AND feature_key = $2",
    )
    .bind(subscription.id)
    .bind("ai_requests")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(ledger, 8);

    let decision = billing
        .check_access_for("pg-owner-1", "ai_requests")
        .await
        .unwrap();
    assert_eq!(decision.remaining, Some(2));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn postgres_event_dedupe_and_reconcile(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let billing = service(&pool);
    let reconciler = Reconciler::new(billing.clone(), Arc::new(PlanCatalog::builtin()), None);

    let attrs = SubscriptionAttrs {
        external_subscription_id: Some("sub_pg".into()),
        ..SubscriptionAttrs::new("free", PlanType::Free, SubscriptionStatus::Active)
    };
    billing
        .create_or_sync_subscription("pg-owner-2", &attrs, "test")
        .await
        .unwrap();

    let envelope = ProcessorEnvelope::parse(
        json!({
            "id": "evt_pg_1",
            "type": "invoice.payment_failed",
            "created": Utc::now().timestamp(),
            "data": { "object": { "id": "in_pg", "subscription": "sub_pg" } },
        }),
        Utc::now(),
    )
    .unwrap();

    assert_eq!(
        reconciler.ingest_and_reconcile(envelope.clone()).await.unwrap(),
        ReconcileOutcome::Applied
    );
    assert!(matches!(
        reconciler.ingest(envelope).await.unwrap(),
        RecordOutcome::Duplicate(event) if event.processed
    ));
    let subscription = billing.require_subscription("pg-owner-2").await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::PastDue);
}
