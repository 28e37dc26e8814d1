use std::sync::Arc;

use marketplace_billing::audit::MemoryAuditSink;
use marketplace_billing::billing::{
    BillingService, PlanType, SubscriptionAttrs, SubscriptionStatus, UsageOptions,
};
use marketplace_billing::error::BillingError;
use marketplace_billing::store::MemoryStore;

fn service() -> (BillingService, MemoryStore, MemoryAuditSink) {
    let store = MemoryStore::new();
    let audit = MemoryAuditSink::new();
    let billing = BillingService::new(Arc::new(store.clone()), Arc::new(audit.clone()));
    (billing, store, audit)
}

fn pro_attrs(limit: i64) -> SubscriptionAttrs {
    SubscriptionAttrs::new("pro", PlanType::Paid, SubscriptionStatus::Active)
        .with_feature("ai_requests", Some(limit))
        .with_feature("exports", None)
}

#[tokio::test]
async fn access_denied_once_limit_reached() {
    let (billing, _, _) = service();
    billing
        .create_or_sync_subscription("owner-1", &pro_attrs(2), "test")
        .await
        .unwrap();

    let decision = billing.check_access_for("owner-1", "ai_requests").await.unwrap();
    assert!(decision.has_access);
    assert_eq!(decision.remaining, Some(2));

    for _ in 0..2 {
        billing
            .track_usage("owner-1", "ai_requests", 1, UsageOptions::default(), "test")
            .await
            .unwrap();
    }

    let decision = billing.check_access_for("owner-1", "ai_requests").await.unwrap();
    assert!(!decision.has_access);
    assert_eq!(decision.current_usage, 2);
    assert_eq!(decision.remaining, Some(0));

    // unlimited features stay open
    let exports = billing.check_access_for("owner-1", "exports").await.unwrap();
    assert!(exports.has_access);
    assert_eq!(exports.limit, None);
}

#[tokio::test]
async fn unknown_owner_and_missing_feature_are_denied() {
    let (billing, _, _) = service();
    let decision = billing.check_access_for("nobody", "ai_requests").await.unwrap();
    assert!(!decision.has_access);
    assert_eq!(decision.reason.as_deref(), Some("no subscription"));

    billing
        .create_or_sync_subscription("owner-2", &pro_attrs(5), "test")
        .await
        .unwrap();
    let decision = billing.check_access_for("owner-2", "sso").await.unwrap();
    assert!(!decision.has_access);
    assert_eq!(decision.reason.as_deref(), Some("feature not included"));
}

#[tokio::test]
async fn overflowing_usage_is_rejected_without_a_ledger_entry() {
    let (billing, store, _) = service();
    let subscription = billing
        .create_or_sync_subscription("owner-9", &pro_attrs(5), "test")
        .await
        .unwrap();
    billing
        .track_usage("owner-9", "exports", i64::MAX, UsageOptions::default(), "test")
        .await
        .unwrap();

    let err = billing
        .track_usage("owner-9", "exports", 10, UsageOptions::default(), "test")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation(_)));

    let subscription_after = billing.require_subscription("owner-9").await.unwrap();
    assert_eq!(subscription_after.usage_for("exports"), i64::MAX);
    assert_eq!(store.usage_entry_count(subscription.id, "exports").await, 1);
}

#[tokio::test]
async fn past_due_subscription_loses_access() {
    let (billing, _, _) = service();
    billing
        .create_or_sync_subscription("owner-3", &pro_attrs(5), "test")
        .await
        .unwrap();
    billing
        .update_status("owner-3", SubscriptionStatus::PastDue, None, "test")
        .await
        .unwrap();
    let decision = billing.check_access_for("owner-3", "exports").await.unwrap();
    assert!(!decision.has_access);
    assert_eq!(decision.reason.as_deref(), Some("subscription is past_due"));
}

#[tokio::test]
async fn reset_zeroes_counters_and_keeps_ledger() {
    let (billing, store, audit) = service();
    let subscription = billing
        .create_or_sync_subscription("owner-4", &pro_attrs(10), "test")
        .await
        .unwrap();
    billing
        .track_usage("owner-4", "ai_requests", 3, UsageOptions::default(), "test")
        .await
        .unwrap();

    let reset = billing.reset_usage("owner-4", "test").await.unwrap();
    assert_eq!(reset.usage_for("ai_requests"), 0);
    assert_eq!(store.usage_entry_count(subscription.id, "ai_requests").await, 1);
    assert!(audit
        .actions()
        .await
        .iter()
        .any(|action| action == "subscription.usage_reset"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_usage_tracking_is_atomic() {
    let (billing, store, _) = service();
    let subscription = billing
        .create_or_sync_subscription("owner-5", &pro_attrs(1_000), "test")
        .await
        .unwrap();

    let tasks = 50;
    let mut handles = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        let billing = billing.clone();
        handles.push(tokio::spawn(async move {
            billing
                .track_usage("owner-5", "ai_requests", 1, UsageOptions::default(), "test")
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let current = billing.require_subscription("owner-5").await.unwrap();
    assert_eq!(current.usage_for("ai_requests"), tasks as i64);
    assert_eq!(
        store.usage_entry_count(subscription.id, "ai_requests").await,
        tasks
    );
}
