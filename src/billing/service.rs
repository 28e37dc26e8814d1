use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::access::check_access;
use super::models::{
    AccessDecision, Applied, FeatureUsageStats, PaymentEvent, PaymentEventType, Subscription,
    SubscriptionAttrs, SubscriptionStatus, UsageLogEntry, UsageOptions, UsageStats,
    UsageTrackResult,
};
use crate::audit::{self, AuditRecord, AuditSink};
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, NewUsage, Transition};

/// Upper bound used when counting ledger entries for usage stats.
const STATS_ENTRY_SCAN_LIMIT: i64 = 100_000;

#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn AuditSink>,
}

impl BillingService {
    pub fn new(store: Arc<dyn BillingStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub async fn subscription(&self, owner_id: &str) -> BillingResult<Option<Subscription>> {
        self.store.find_subscription(owner_id).await
    }

    pub async fn require_subscription(&self, owner_id: &str) -> BillingResult<Subscription> {
        self.store
            .find_subscription(owner_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription"))
    }

    /// Upsert keyed by owner. New subscriptions start with zeroed usage; syncs
    /// never touch usage.
    pub async fn create_or_sync_subscription(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        actor: &str,
    ) -> BillingResult<Subscription> {
        validate_attrs(attrs)?;
        let now = Utc::now();
        let transition = self.store.upsert_subscription(owner_id, attrs, now).await?;
        self.announce_upsert(owner_id, &transition, actor, now).await;
        Ok(transition.after)
    }

    /// Same upsert, driven by a processor event occurring at `event_at`. A subscription that
    /// has already seen a newer event comes back as `Applied::Stale` and nothing is emitted.
    pub async fn sync_subscription_from_event(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        event_at: DateTime<Utc>,
        actor: &str,
    ) -> BillingResult<Applied<Transition<Subscription>>> {
        validate_attrs(attrs)?;
        let now = Utc::now();
        let applied = self
            .store
            .upsert_subscription_from_event(owner_id, attrs, event_at, now)
            .await?;
        match &applied {
            Applied::Updated(transition) => {
                self.announce_upsert(owner_id, transition, actor, now).await
            }
            Applied::Stale(transition) => tracing::debug!(
                %owner_id,
                subscription = %transition.after.id,
                "older checkout event left subscription untouched"
            ),
        }
        Ok(applied)
    }

    async fn announce_upsert(
        &self,
        owner_id: &str,
        transition: &Transition<Subscription>,
        actor: &str,
        now: DateTime<Utc>,
    ) {
        let subscription = &transition.after;
        let (event_type, action) = match &transition.before {
            None => (PaymentEventType::Created, "subscription.created"),
            Some(before) if before.plan_id != subscription.plan_id => {
                (PaymentEventType::PlanChanged, "subscription.plan_changed")
            }
            Some(before)
                if before.status != subscription.status
                    && subscription.status == SubscriptionStatus::Cancelled =>
            {
                (PaymentEventType::Cancelled, "subscription.cancelled")
            }
            Some(_) => (PaymentEventType::Updated, "subscription.synced"),
        };

        tracing::info!(
            %owner_id,
            subscription = %subscription.id,
            plan = %subscription.plan_id,
            status = subscription.status.as_str(),
            action,
            "subscription upserted"
        );
        self.record_application_event(
            subscription,
            event_type,
            json!({
                "plan_id": subscription.plan_id,
                "status": subscription.status.as_str(),
                "previous_plan_id": transition.before.as_ref().map(|b| b.plan_id.clone()),
            }),
            now,
        )
        .await;
        self.audit_transition(actor, action, transition, now).await;
    }

    pub async fn update_status(
        &self,
        owner_id: &str,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
        actor: &str,
    ) -> BillingResult<Subscription> {
        let now = Utc::now();
        let transition = self
            .store
            .update_status(owner_id, status, end_date, now)
            .await?;
        let subscription = transition.after.clone();
        let previous = transition.before.as_ref().map(|b| b.status);

        tracing::info!(
            %owner_id,
            subscription = %subscription.id,
            from = previous.map(|s| s.as_str()).unwrap_or("none"),
            to = status.as_str(),
            "subscription status updated"
        );
        let event_type = if status == SubscriptionStatus::Cancelled {
            PaymentEventType::Cancelled
        } else {
            PaymentEventType::Updated
        };
        self.record_application_event(
            &subscription,
            event_type,
            json!({
                "status": status.as_str(),
                "previous_status": previous.map(|s| s.as_str()),
                "end_date": end_date,
            }),
            now,
        )
        .await;
        self.audit_transition(actor, "subscription.status_changed", &transition, now)
            .await;
        Ok(subscription)
    }

    /// Zero every counter and stamp `last_reset_at`.
    pub async fn reset_usage(&self, owner_id: &str, actor: &str) -> BillingResult<Subscription> {
        let now = Utc::now();
        let transition = self.store.reset_usage(owner_id, now).await?;
        tracing::info!(%owner_id, subscription = %transition.after.id, "usage counters reset");
        let record = AuditRecord::new(
            actor,
            "subscription.usage_reset",
            "subscription",
            transition.after.id,
            now,
        )
        .with_change(
            transition
                .before
                .as_ref()
                .map(|b| json!({ "usage": b.usage.counters })),
            Some(json!({ "usage": transition.after.usage.counters })),
        );
        audit::emit(self.audit.as_ref(), record).await;
        Ok(transition.after)
    }

    /// Stamp `deleted_at`. The row stays for audit and analytics continuity.
    pub async fn soft_delete(&self, owner_id: &str, actor: &str) -> BillingResult<Subscription> {
        let now = Utc::now();
        let transition = self.store.soft_delete_subscription(owner_id, now).await?;
        tracing::info!(%owner_id, subscription = %transition.after.id, "subscription soft-deleted");
        self.audit_transition(actor, "subscription.deleted", &transition, now)
            .await;
        Ok(transition.after)
    }

    /// Append a ledger entry and bump the counter as one unit.
    pub async fn track_usage(
        &self,
        owner_id: &str,
        feature_key: &str,
        quantity: i64,
        options: UsageOptions,
        actor: &str,
    ) -> BillingResult<UsageTrackResult> {
        let feature_key = feature_key.trim();
        if feature_key.is_empty() {
            return Err(BillingError::validation("feature key must not be empty"));
        }
        if quantity < 0 {
            return Err(BillingError::validation("quantity must be non-negative"));
        }

        let now = Utc::now();
        let usage = NewUsage {
            feature_key: feature_key.to_string(),
            quantity,
            options,
        };
        let (entry, subscription) = self.store.track_usage(owner_id, &usage, now).await?;
        let current_usage = subscription.usage_for(feature_key);
        let limit = subscription.limit_for(feature_key);

        tracing::info!(
            %owner_id,
            feature = %feature_key,
            quantity,
            current_usage,
            usage_log = %entry.id,
            "usage tracked"
        );

        if let Some(limit) = limit {
            if current_usage >= limit {
                tracing::warn!(%owner_id, feature = %feature_key, current_usage, limit, "usage limit reached");
                self.record_application_event(
                    &subscription,
                    PaymentEventType::LimitExceeded,
                    json!({
                        "feature_key": feature_key,
                        "current_usage": current_usage,
                        "limit": limit,
                    }),
                    now,
                )
                .await;
            }
        }

        let record = AuditRecord::new(actor, "usage.tracked", "usage_log", entry.id, now).with_change(
            None,
            Some(json!({
                "feature_key": feature_key,
                "quantity": quantity,
                "current_usage": current_usage,
            })),
        );
        audit::emit(self.audit.as_ref(), record).await;

        Ok(UsageTrackResult {
            usage_log_id: entry.id,
            current_usage,
            limit,
        })
    }

    /// Live entitlement check against the stored snapshot.
    pub async fn check_access_for(
        &self,
        owner_id: &str,
        feature_key: &str,
    ) -> BillingResult<AccessDecision> {
        let subscription = self.store.find_subscription(owner_id).await?;
        Ok(check_access(subscription.as_ref(), feature_key))
    }

    /// Per-feature usage for one key, or every key the subscription knows about.
    pub async fn usage_stats(
        &self,
        owner_id: &str,
        feature_key: Option<&str>,
    ) -> BillingResult<UsageStats> {
        let subscription = self.require_subscription(owner_id).await?;
        let keys: BTreeSet<String> = match feature_key {
            Some(key) => BTreeSet::from([key.to_string()]),
            None => subscription
                .features
                .iter()
                .chain(subscription.limits.keys())
                .chain(subscription.usage.counters.keys())
                .cloned()
                .collect(),
        };

        let mut features = Vec::with_capacity(keys.len());
        for key in keys {
            let entries = self
                .store
                .list_usage(
                    subscription.id,
                    Some(&key),
                    Some(subscription.usage.last_reset_at),
                    STATS_ENTRY_SCAN_LIMIT,
                )
                .await?;
            features.push(feature_stats(&subscription, &key, entries.len() as i64));
        }

        Ok(UsageStats {
            owner_id: subscription.owner_id.clone(),
            plan_id: subscription.plan_id.clone(),
            last_reset_at: subscription.usage.last_reset_at,
            features,
        })
    }

    pub async fn list_usage(
        &self,
        owner_id: &str,
        feature_key: Option<&str>,
        limit: i64,
    ) -> BillingResult<Vec<UsageLogEntry>> {
        let subscription = self.require_subscription(owner_id).await?;
        self.store
            .list_usage(subscription.id, feature_key, None, limit)
            .await
    }

    pub async fn unsynced_usage(&self, limit: i64) -> BillingResult<Vec<UsageLogEntry>> {
        self.store.unsynced_usage(limit).await
    }

    /// Flip the processor-sync flag; the only mutation a ledger entry allows.
    pub async fn mark_usage_synced(&self, ids: &[Uuid]) -> BillingResult<u64> {
        let updated = self.store.mark_usage_synced(ids, Utc::now()).await?;
        tracing::debug!(requested = ids.len(), updated, "usage entries marked synced");
        Ok(updated)
    }

    pub async fn events_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        self.store.list_events_for_owner(owner_id, limit).await
    }

    async fn record_application_event(
        &self,
        subscription: &Subscription,
        event_type: PaymentEventType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let event = PaymentEvent::application(subscription, event_type, payload, now);
        if let Err(err) = self.store.record_event(&event).await {
            tracing::warn!(
                ?err,
                owner_id = %subscription.owner_id,
                event_type = event_type.as_str(),
                "failed to record application payment event"
            );
        }
    }

    async fn audit_transition(
        &self,
        actor: &str,
        action: &str,
        transition: &Transition<Subscription>,
        now: DateTime<Utc>,
    ) {
        let record = AuditRecord::new(actor, action, "subscription", transition.after.id, now)
            .with_change(
                transition.before.as_ref().map(Subscription::audit_summary),
                Some(transition.after.audit_summary()),
            );
        audit::emit(self.audit.as_ref(), record).await;
    }
}

fn validate_attrs(attrs: &SubscriptionAttrs) -> BillingResult<()> {
    if attrs.plan_id.trim().is_empty() {
        return Err(BillingError::validation("plan id must not be empty"));
    }
    if let Some((key, _)) = attrs.limits.iter().find(|(_, limit)| **limit < 0) {
        return Err(BillingError::validation(format!(
            "limit for {key} must be non-negative"
        )));
    }
    if attrs.features.iter().any(|key| key.trim().is_empty()) {
        return Err(BillingError::validation("feature key must not be empty"));
    }
    Ok(())
}

fn feature_stats(subscription: &Subscription, key: &str, entries_since_reset: i64) -> FeatureUsageStats {
    let current_usage = subscription.usage_for(key);
    let limit = subscription.limit_for(key);
    let percent_used = limit.map(|limit| {
        if limit <= 0 {
            100.0
        } else {
            current_usage as f64 * 100.0 / limit as f64
        }
    });
    FeatureUsageStats {
        feature_key: key.to_string(),
        current_usage,
        limit,
        remaining: limit.map(|limit| (limit - current_usage).max(0)),
        percent_used,
        entries_since_reset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::billing::models::PlanType;
    use crate::store::{MemoryStore, PaymentEventStore};

    fn service() -> (BillingService, MemoryStore, MemoryAuditSink) {
        let store = MemoryStore::new();
        let audit = MemoryAuditSink::new();
        let service = BillingService::new(Arc::new(store.clone()), Arc::new(audit.clone()));
        (service, store, audit)
    }

    fn pro_attrs() -> SubscriptionAttrs {
        SubscriptionAttrs::new("pro", PlanType::Paid, SubscriptionStatus::Active)
            .with_feature("ai_requests", Some(10))
            .with_feature("exports", None)
    }

    #[tokio::test]
    async fn sync_keeps_counters() {
        let (service, _, _) = service();
        service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();
        service
            .track_usage("owner-1", "ai_requests", 4, UsageOptions::default(), "test")
            .await
            .unwrap();

        let synced = service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();
        assert_eq!(synced.usage_for("ai_requests"), 4);
    }

    #[tokio::test]
    async fn rejects_invalid_usage_before_touching_store() {
        let (service, store, _) = service();
        let sub = service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();

        let err = service
            .track_usage("owner-1", "ai_requests", -1, UsageOptions::default(), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        let err = service
            .track_usage("owner-1", "  ", 1, UsageOptions::default(), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(store.usage_entry_count(sub.id, "ai_requests").await, 0);
    }

    #[tokio::test]
    async fn tracking_without_subscription_is_not_found() {
        let (service, _, _) = service();
        let err = service
            .track_usage("nobody", "ai_requests", 1, UsageOptions::default(), "test")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "subscription not found");
    }

    #[tokio::test]
    async fn reaching_limit_records_limit_exceeded() {
        let (service, store, _) = service();
        service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();
        service
            .track_usage("owner-1", "ai_requests", 10, UsageOptions::default(), "test")
            .await
            .unwrap();

        let events = store.list_events_for_owner("owner-1", 10).await.unwrap();
        assert!(events
            .iter()
            .any(|event| event.event_type == PaymentEventType::LimitExceeded));
        assert!(events.iter().all(|event| event.processed));
    }

    #[tokio::test]
    async fn usage_stats_report_percent_and_entries() {
        let (service, _, _) = service();
        service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();
        for _ in 0..3 {
            service
                .track_usage("owner-1", "ai_requests", 1, UsageOptions::default(), "test")
                .await
                .unwrap();
        }

        let stats = service.usage_stats("owner-1", None).await.unwrap();
        let ai = stats
            .features
            .iter()
            .find(|f| f.feature_key == "ai_requests")
            .unwrap();
        assert_eq!(ai.current_usage, 3);
        assert_eq!(ai.remaining, Some(7));
        assert_eq!(ai.percent_used, Some(30.0));
        assert_eq!(ai.entries_since_reset, 3);

        let exports = stats
            .features
            .iter()
            .find(|f| f.feature_key == "exports")
            .unwrap();
        assert_eq!(exports.limit, None);
        assert_eq!(exports.percent_used, None);

        service.reset_usage("owner-1", "test").await.unwrap();
        let stats = service.usage_stats("owner-1", Some("ai_requests")).await.unwrap();
        assert_eq!(stats.features.len(), 1);
        assert_eq!(stats.features[0].current_usage, 0);
    }

    #[tokio::test]
    async fn mutations_emit_audit_records() {
        let (service, _, audit) = service();
        service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "owner:owner-1")
            .await
            .unwrap();
        service
            .update_status("owner-1", SubscriptionStatus::PastDue, None, "owner:owner-1")
            .await
            .unwrap();
        service
            .track_usage("owner-1", "exports", 1, UsageOptions::default(), "owner:owner-1")
            .await
            .unwrap();
        service.soft_delete("owner-1", "owner:owner-1").await.unwrap();

        assert_eq!(
            audit.actions().await,
            vec![
                "subscription.created",
                "subscription.status_changed",
                "usage.tracked",
                "subscription.deleted",
            ]
        );
        let records = audit.records().await;
        assert!(records[0].before.is_none());
        assert_eq!(records[1].before.as_ref().unwrap()["status"], "active");
        assert_eq!(records[1].after.as_ref().unwrap()["status"], "past_due");
    }

    #[tokio::test]
    async fn soft_deleted_owner_can_resubscribe() {
        let (service, _, _) = service();
        let first = service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();
        service.soft_delete("owner-1", "test").await.unwrap();
        assert!(service.subscription("owner-1").await.unwrap().is_none());

        let second = service
            .create_or_sync_subscription("owner-1", &pro_attrs(), "test")
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }
}
