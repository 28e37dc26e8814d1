use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use marketplace_billing::audit::MemoryAuditSink;
use marketplace_billing::billing::{
    BillingInterval, BillingService, PlanCatalog, PlanDefinition, PlanType, ProcessorEnvelope,
    ProviderKind, ReconcileOutcome, Reconciler, SubscriptionAttrs, SubscriptionStatus,
};
use marketplace_billing::store::MemoryStore;

struct Harness {
    billing: BillingService,
    store: MemoryStore,
    audit: MemoryAuditSink,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let audit = MemoryAuditSink::new();
    let billing = BillingService::new(Arc::new(store.clone()), Arc::new(audit.clone()));
    let catalog = PlanCatalog::new(vec![PlanDefinition {
        id: "pro".into(),
        name: "Pro".into(),
        plan_type: PlanType::Paid,
        price_id: Some("price_pro".into()),
        interval: BillingInterval::Month,
        features: BTreeSet::from(["ai_requests".to_string()]),
        limits: BTreeMap::from([("ai_requests".to_string(), 100)]),
        trial_days: None,
    }]);
    let reconciler = Reconciler::new(
        billing.clone(),
        Arc::new(catalog),
        Some(ProviderKind::Stripe),
    );
    Harness {
        billing,
        store,
        audit,
        reconciler,
    }
}

fn envelope(id: &str, kind: &str, created: i64, object: Value) -> ProcessorEnvelope {
    ProcessorEnvelope::parse(
        json!({
            "id": id,
            "type": kind,
            "created": created,
            "data": { "object": object },
        }),
        Utc::now(),
    )
    .unwrap()
}

fn checkout(owner: &str, subscription: &str) -> Value {
    json!({
        "id": "cs_test_1",
        "mode": "subscription",
        "client_reference_id": owner,
        "customer": "cus_1",
        "subscription": subscription,
        "metadata": { "plan_id": "pro" },
    })
}

#[tokio::test]
async fn redelivered_event_is_applied_once() {
    let h = harness();
    let now = Utc::now().timestamp();
    let event = envelope("evt_1", "checkout.session.completed", now, checkout("owner-1", "sub_1"));

    let first = h.reconciler.ingest_and_reconcile(event.clone()).await.unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);
    let subscription = h.billing.require_subscription("owner-1").await.unwrap();
    assert_eq!(subscription.plan_id, "pro");
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.provider.as_deref(), Some("stripe"));
    assert_eq!(subscription.external_subscription_id.as_deref(), Some("sub_1"));
    let recorded = h.store.event_count().await;

    let second = h.reconciler.ingest_and_reconcile(event).await.unwrap();
    assert_eq!(second, ReconcileOutcome::AlreadyProcessed);
    assert_eq!(h.store.event_count().await, recorded);

    let processed = h
        .audit
        .actions()
        .await
        .iter()
        .filter(|action| action.as_str() == "payment_event.processed")
        .count();
    assert_eq!(processed, 1);
}

#[tokio::test]
async fn older_event_does_not_overwrite_newer_state() {
    let h = harness();
    let now = Utc::now();
    h.reconciler
        .ingest_and_reconcile(envelope(
            "evt_checkout",
            "checkout.session.completed",
            (now - Duration::minutes(10)).timestamp(),
            checkout("owner-2", "sub_2"),
        ))
        .await
        .unwrap();

    let newer = envelope(
        "evt_newer",
        "customer.subscription.updated",
        now.timestamp(),
        json!({ "id": "sub_2", "status": "past_due", "customer": "cus_1" }),
    );
    let older = envelope(
        "evt_older",
        "customer.subscription.updated",
        (now - Duration::minutes(5)).timestamp(),
        json!({ "id": "sub_2", "status": "active", "customer": "cus_1" }),
    );

    assert_eq!(
        h.reconciler.ingest_and_reconcile(newer).await.unwrap(),
        ReconcileOutcome::Applied
    );
    assert_eq!(
        h.reconciler.ingest_and_reconcile(older).await.unwrap(),
        ReconcileOutcome::Stale
    );
    let subscription = h.billing.require_subscription("owner-2").await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::PastDue);
}

#[tokio::test]
async fn late_subscription_created_does_not_undo_checkout() {
    let h = harness();
    let now = Utc::now();
    let completed = envelope(
        "evt_checkout_late",
        "checkout.session.completed",
        now.timestamp(),
        checkout("owner-6", "sub_6"),
    );
    let created = envelope(
        "evt_created_late",
        "customer.subscription.created",
        (now - Duration::seconds(1)).timestamp(),
        json!({ "id": "sub_6", "status": "incomplete", "customer": "cus_1" }),
    );

    assert_eq!(
        h.reconciler.ingest_and_reconcile(completed).await.unwrap(),
        ReconcileOutcome::Applied
    );
    assert_eq!(
        h.reconciler.ingest_and_reconcile(created).await.unwrap(),
        ReconcileOutcome::Stale
    );
    let subscription = h.billing.require_subscription("owner-6").await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.last_event_at.map(|at| at.timestamp()), Some(now.timestamp()));
}

#[tokio::test]
async fn older_checkout_does_not_overwrite_newer_update() {
    let h = harness();
    let now = Utc::now();
    h.reconciler
        .ingest_and_reconcile(envelope(
            "evt_first_checkout",
            "checkout.session.completed",
            (now - Duration::minutes(10)).timestamp(),
            checkout("owner-7", "sub_7"),
        ))
        .await
        .unwrap();
    h.reconciler
        .ingest_and_reconcile(envelope(
            "evt_past_due",
            "customer.subscription.updated",
            now.timestamp(),
            json!({ "id": "sub_7", "status": "past_due" }),
        ))
        .await
        .unwrap();

    let replayed_checkout = envelope(
        "evt_old_checkout",
        "checkout.session.completed",
        (now - Duration::minutes(5)).timestamp(),
        checkout("owner-7", "sub_7"),
    );
    assert_eq!(
        h.reconciler.ingest_and_reconcile(replayed_checkout).await.unwrap(),
        ReconcileOutcome::Stale
    );
    let subscription = h.billing.require_subscription("owner-7").await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::PastDue);
}

#[tokio::test]
async fn price_change_switches_plan_and_keeps_usage() {
    let h = harness();
    let attrs = SubscriptionAttrs {
        external_subscription_id: Some("sub_3".into()),
        ..SubscriptionAttrs::new("free", PlanType::Free, SubscriptionStatus::Active)
    };
    h.billing
        .create_or_sync_subscription("owner-3", &attrs, "test")
        .await
        .unwrap();

    let outcome = h
        .reconciler
        .ingest_and_reconcile(envelope(
            "evt_upgrade",
            "customer.subscription.updated",
            Utc::now().timestamp(),
            json!({
                "id": "sub_3",
                "status": "active",
                "items": { "data": [ { "price": { "id": "price_pro" } } ] },
            }),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);

    let subscription = h.billing.require_subscription("owner-3").await.unwrap();
    assert_eq!(subscription.plan_id, "pro");
    assert_eq!(subscription.plan_type, PlanType::Paid);
    assert_eq!(subscription.limit_for("ai_requests"), Some(100));
}

#[tokio::test]
async fn missing_target_fails_then_replays() {
    let h = harness();
    let event = envelope(
        "evt_invoice",
        "invoice.payment_failed",
        Utc::now().timestamp(),
        json!({ "id": "in_1", "subscription": "sub_4" }),
    );

    let outcome = h.reconciler.ingest_and_reconcile(event).await.unwrap();
    let ReconcileOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("sub_4"));

    let attrs = SubscriptionAttrs {
        external_subscription_id: Some("sub_4".into()),
        ..SubscriptionAttrs::new("pro", PlanType::Paid, SubscriptionStatus::Active)
    };
    h.billing
        .create_or_sync_subscription("owner-4", &attrs, "test")
        .await
        .unwrap();

    let replayed = h.reconciler.replay_failed(10).await.unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].1, ReconcileOutcome::Applied);
    let subscription = h.billing.require_subscription("owner-4").await.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::PastDue);

    // nothing left to replay
    assert!(h.reconciler.replay_failed(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn unsupported_events_are_recorded_and_ignored() {
    let h = harness();
    let outcome = h
        .reconciler
        .ingest_and_reconcile(envelope(
            "evt_misc",
            "customer.created",
            Utc::now().timestamp(),
            json!({ "id": "cus_9" }),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Ignored);
    assert_eq!(h.store.event_count().await, 1);
    assert!(h.reconciler.replay_failed(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn cleared_event_can_be_reconciled_again() {
    let h = harness();
    let event = envelope(
        "evt_clear",
        "checkout.session.completed",
        Utc::now().timestamp(),
        checkout("owner-5", "sub_5"),
    );
    h.reconciler.ingest_and_reconcile(event.clone()).await.unwrap();
    let recorded = match h.reconciler.ingest(event).await.unwrap() {
        marketplace_billing::billing::models::RecordOutcome::Duplicate(event) => event,
        other => panic!("expected duplicate, got {other:?}"),
    };
    assert!(recorded.processed);

    let cleared = h
        .reconciler
        .clear_processed(recorded.id, "operator")
        .await
        .unwrap();
    assert!(!cleared.processed);
    assert_eq!(
        h.reconciler.reconcile(recorded.id).await,
        ReconcileOutcome::Applied
    );
    assert!(h
        .audit
        .actions()
        .await
        .iter()
        .any(|action| action == "payment_event.cleared"));
}
